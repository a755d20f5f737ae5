//! Content-addressed store of node results.
//!
//! Every node instance is identified by a [`Fingerprint`] of its node name,
//! version, declared outputs and resolved inputs. The outputs it produced are
//! stored under that fingerprint, so a later instance with the same identity
//! is served from disk instead of running its body again.
//!
//! Layout: `<root>/<first two hex digits>/<fingerprint>.cbor`.

use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32, Value};
use crate::engine::{Inputs, Outputs, TaskNode};
use crate::error::{CacheError, InvalidInput};

/// Bumped whenever the fingerprint derivation changes.
const FORMAT: &str = "kumiki/1";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Deterministic identity of a node instance.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Hash32);

impl Fingerprint {
    /// Fingerprints `node` run with `inputs`.
    ///
    /// Values are identified by their canonical JSON encoding, so a file path
    /// is identified by the path alone. For inputs marked with
    /// [`NodeBuilder::track_file`](crate::NodeBuilder::track_file), the
    /// content of every file named in the value is hashed as well; a tracked
    /// file that can't be read is an [`InvalidInput`].
    pub fn of(node: &TaskNode, inputs: &Inputs) -> Result<Self, InvalidInput> {
        let mut hasher = Blake3Hasher::default();

        hasher
            .field(FORMAT)
            .field(node.name())
            .field(node.version.as_deref().unwrap_or_default())
            .field((node.outputs.len() as u64).to_le_bytes());

        for output in &node.outputs {
            hasher.field(output);
        }

        for (name, value) in inputs.iter() {
            let encoded = serde_json::to_vec(value).map_err(|err| InvalidInput::new(name, err))?;
            hasher.field(name).field(encoded);

            if node.tracked.contains(name) {
                let mut paths = Vec::new();
                collect_paths(value, &mut paths);

                for path in paths {
                    let hash = Hash32::hash_file(path).map_err(|err| {
                        InvalidInput::new(name, format!("couldn't read tracked file '{path}': {err}"))
                    })?;
                    hasher.field(path).field(hash.as_bytes());
                }
            }
        }

        Ok(Fingerprint(hasher.into()))
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

fn collect_paths<'a>(value: &'a Value, acc: &mut Vec<&'a str>) {
    match value {
        Value::String(path) => acc.push(path),
        Value::Array(items) => items.iter().for_each(|item| collect_paths(item, acc)),
        Value::Object(map) => map.values().for_each(|item| collect_paths(item, acc)),
        _ => {}
    }
}

#[derive(Serialize, Deserialize)]
struct Record<'a> {
    node: Cow<'a, str>,
    outputs: Cow<'a, Outputs>,
}

/// Directory-backed store of node outputs, keyed by [`Fingerprint`].
///
/// Safe to share between workers. A record is written to a temporary file
/// and renamed into place, so a concurrent lookup sees either nothing or the
/// whole record. Two workers storing the same fingerprint simply overwrite
/// each other with equivalent data.
///
/// Entries never expire. Point separate experiments at separate directories
/// if results must not be shared between them.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
}

impl CacheStore {
    /// Opens (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Utf8Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root).map_err(io_error(&root))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Location of the record for `fingerprint`.
    pub fn path(&self, fingerprint: &Fingerprint) -> Utf8PathBuf {
        let hex = fingerprint.to_hex();
        self.root.join(&hex[..2]).join(hex).with_extension("cbor")
    }

    /// Returns the stored outputs, or `None` on a miss. A record that can't be
    /// decoded counts as a miss and will be overwritten by the next store.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Outputs>, CacheError> {
        let path = self.path(fingerprint);

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path)(err)),
        };

        match ciborium::from_reader::<Record<'static>, _>(BufReader::new(file)) {
            Ok(record) => Ok(Some(record.outputs.into_owned())),
            Err(err) => {
                tracing::warn!("Ignoring unreadable cache record {}: {}", path, err);
                Ok(None)
            }
        }
    }

    /// Stores the outputs `node` produced under `fingerprint`.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        node: &str,
        outputs: &Outputs,
    ) -> Result<(), CacheError> {
        let path = self.path(fingerprint);
        let dir = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(dir).map_err(io_error(dir))?;

        let temp = dir.join(format!(
            ".{}.{}.{}.tmp",
            fingerprint.to_hex(),
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let record = Record {
            node: Cow::Borrowed(node),
            outputs: Cow::Borrowed(outputs),
        };

        if let Err(err) = write_record(&temp, &record) {
            let _ = fs::remove_file(&temp);
            return Err(err);
        }

        fs::rename(&temp, &path).map_err(io_error(&path))?;
        tracing::debug!("Stored {} for {}", fingerprint, node);

        Ok(())
    }
}

fn write_record(path: &Utf8Path, record: &Record) -> Result<(), CacheError> {
    let file = File::create(path).map_err(io_error(path))?;
    let mut writer = BufWriter::new(file);
    ciborium::into_writer(record, &mut writer)?;
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

fn io_error(path: &Utf8Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_string(),
        source,
    }
}

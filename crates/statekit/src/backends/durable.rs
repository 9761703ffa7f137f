//! Actor-backed durable store
//!
//! The store is hosted by a worker that owns the key/value map and processes
//! requests one at a time from its mailbox. The worker is provisioned on first
//! `init` by a [`Provisioner`]; [`LocalProvisioner`] runs it on a dedicated thread,
//! optionally snapshotting to a journal file after every mutation.
//!
//! A provisioning failure is reported as [`Error::Provisioning`]. The store never
//! falls back to another backend.

use crate::codec::RecordCodec;
use crate::error::{Error, Result};
use crate::record::StateRecord;
use crate::store::{StateStore, check_key, qualify, unqualify};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

type Respond<T> = Sender<Result<T>>;

/// Messages understood by a state worker
#[derive(Debug)]
pub enum WorkerRequest {
    Get {
        key: String,
        respond_to: Respond<Option<String>>,
    },
    Put {
        key: String,
        record: String,
        respond_to: Respond<()>,
    },
    Delete {
        key: String,
        respond_to: Respond<()>,
    },
    List {
        prefix: String,
        respond_to: Respond<Vec<String>>,
    },
    Shutdown,
}

/// Client half of a running worker; shuts the worker down when dropped
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    mailbox: Sender<WorkerRequest>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Wrap a mailbox, optionally with the thread serving it
    pub fn new(
        name: impl Into<String>,
        mailbox: Sender<WorkerRequest>,
        thread: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            name: name.into(),
            mailbox,
            thread,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn client(&self) -> WorkerClient {
        WorkerClient {
            name: self.name.clone(),
            mailbox: self.mailbox.clone(),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.mailbox.send(WorkerRequest::Shutdown);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::warn!("State worker '{}' panicked", self.name);
        }
    }
}

/// Cloneable sender used for individual requests
struct WorkerClient {
    name: String,
    mailbox: Sender<WorkerRequest>,
}

impl WorkerClient {
    fn ask<T>(&self, build: impl FnOnce(Respond<T>) -> WorkerRequest) -> Result<T> {
        let (respond_to, response) = mpsc::channel();
        self.mailbox
            .send(build(respond_to))
            .map_err(|_| Error::WorkerGone(self.name.clone()))?;
        response
            .recv()
            .map_err(|_| Error::WorkerGone(self.name.clone()))?
    }
}

/// Brings up the worker that hosts a durable store
pub trait Provisioner: Send + Sync {
    fn provision(&self, worker: &str) -> Result<WorkerHandle>;
}

/// Runs state workers as threads in this process
#[derive(Debug, Clone, Default)]
pub struct LocalProvisioner {
    journal_dir: Option<PathBuf>,
}

impl LocalProvisioner {
    /// Workers keep their data in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Workers snapshot their data to `<dir>/<worker>.json`
    pub fn with_journal(dir: impl Into<PathBuf>) -> Self {
        Self {
            journal_dir: Some(dir.into()),
        }
    }

    fn load_journal(path: &Path) -> std::result::Result<BTreeMap<String, String>, String> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| e.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl Provisioner for LocalProvisioner {
    fn provision(&self, worker: &str) -> Result<WorkerHandle> {
        let provisioning = |reason: String| Error::Provisioning {
            worker: worker.to_string(),
            reason,
        };

        let journal = match &self.journal_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| provisioning(e.to_string()))?;
                Some(dir.join(format!("{worker}.json")))
            }
            None => None,
        };
        let entries = match &journal {
            Some(path) => Self::load_journal(path).map_err(provisioning)?,
            None => BTreeMap::new(),
        };

        let (mailbox, inbox) = mpsc::channel();
        let actor = StateWorker {
            name: worker.to_string(),
            entries,
            journal,
        };
        let thread = thread::Builder::new()
            .name(worker.to_string())
            .spawn(move || actor.run(&inbox))
            .map_err(|e| provisioning(e.to_string()))?;

        Ok(WorkerHandle::new(worker, mailbox, Some(thread)))
    }
}

/// Server half: owns the map and handles requests sequentially
struct StateWorker {
    name: String,
    entries: BTreeMap<String, String>,
    journal: Option<PathBuf>,
}

impl StateWorker {
    fn run(mut self, inbox: &Receiver<WorkerRequest>) {
        log::debug!(
            "State worker '{}' started with {} records",
            self.name,
            self.entries.len()
        );

        while let Ok(request) = inbox.recv() {
            match request {
                WorkerRequest::Get { key, respond_to } => {
                    let _ = respond_to.send(Ok(self.entries.get(&key).cloned()));
                }
                WorkerRequest::Put {
                    key,
                    record,
                    respond_to,
                } => {
                    let previous = self.entries.insert(key.clone(), record);
                    let result = self.persist();
                    if result.is_err() {
                        match previous {
                            Some(previous) => self.entries.insert(key, previous),
                            None => self.entries.remove(&key),
                        };
                    }
                    let _ = respond_to.send(result);
                }
                WorkerRequest::Delete { key, respond_to } => {
                    let result = match self.entries.remove(&key) {
                        Some(previous) => {
                            let result = self.persist();
                            if result.is_err() {
                                self.entries.insert(key, previous);
                            }
                            result
                        }
                        None => Ok(()),
                    };
                    let _ = respond_to.send(result);
                }
                WorkerRequest::List { prefix, respond_to } => {
                    let keys = self
                        .entries
                        .keys()
                        .filter(|k| k.starts_with(&prefix))
                        .cloned()
                        .collect();
                    let _ = respond_to.send(Ok(keys));
                }
                WorkerRequest::Shutdown => break,
            }
        }

        log::debug!("State worker '{}' stopped", self.name);
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.journal else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Hosting {
    worker: Option<WorkerHandle>,
    sessions: usize,
}

/// State store hosted by a provisioned worker
///
/// `init` provisions the worker on first use and counts sessions; the worker is
/// shut down when the last session calls `deinit`.
#[derive(Debug)]
pub struct DurableStore<P> {
    provisioner: P,
    namespace: String,
    codec: RecordCodec,
    hosting: Mutex<Hosting>,
}

impl<P: Provisioner> DurableStore<P> {
    pub fn new(provisioner: P, namespace: impl Into<String>, codec: RecordCodec) -> Self {
        Self {
            provisioner,
            namespace: namespace.into(),
            codec,
            hosting: Mutex::default(),
        }
    }

    /// Name of the worker hosting this namespace
    pub fn worker_name(&self) -> String {
        let digest = blake3::hash(self.namespace.as_bytes()).to_hex();
        format!("stratum-state-{}", &digest[..12])
    }

    pub fn is_running(&self) -> bool {
        self.hosting().worker.is_some()
    }

    fn hosting(&self) -> MutexGuard<'_, Hosting> {
        match self.hosting.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn client(&self) -> Result<WorkerClient> {
        self.hosting()
            .worker
            .as_ref()
            .map(WorkerHandle::client)
            .ok_or(Error::NotInitialized)
    }
}

impl<P: Provisioner> StateStore for DurableStore<P> {
    fn init(&self) -> Result<()> {
        let mut hosting = self.hosting();
        if hosting.worker.is_none() {
            let name = self.worker_name();
            log::info!("Provisioning state worker '{name}'");
            hosting.worker = Some(self.provisioner.provision(&name)?);
        }
        hosting.sessions += 1;
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        let retired = {
            let mut hosting = self.hosting();
            hosting.sessions = hosting.sessions.saturating_sub(1);
            if hosting.sessions == 0 {
                hosting.worker.take()
            } else {
                None
            }
        };
        if let Some(worker) = retired {
            log::debug!("Shutting down state worker '{}'", worker.name());
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<StateRecord>> {
        check_key(key)?;
        let physical = qualify(&self.namespace, key);
        self.client()?
            .ask(|respond_to| WorkerRequest::Get {
                key: physical,
                respond_to,
            })?
            .map(|text| self.codec.decode(key, text.as_bytes()))
            .transpose()
    }

    fn set(&self, key: &str, record: &StateRecord) -> Result<()> {
        check_key(key)?;
        let bytes = self.codec.encode(record)?;
        let record = String::from_utf8(bytes).map_err(|e| Error::CorruptRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        let physical = qualify(&self.namespace, key);
        self.client()?.ask(|respond_to| WorkerRequest::Put {
            key: physical,
            record,
            respond_to,
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let physical = qualify(&self.namespace, key);
        self.client()?.ask(|respond_to| WorkerRequest::Delete {
            key: physical,
            respond_to,
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let prefix = qualify(&self.namespace, "");
        let keys = self.client()?.ask(|respond_to| WorkerRequest::List {
            prefix,
            respond_to,
        })?;
        let mut keys: Vec<String> = keys
            .iter()
            .filter_map(|k| unqualify(&self.namespace, k))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn backend(&self) -> &'static str {
        "durable"
    }
}

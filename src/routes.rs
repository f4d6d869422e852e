//! Routing table mapping public domains to local backend ports
//!
//! The table is written by the control listener only, and read on every proxied
//! request and every ACME handshake. It lives behind a reader/writer lock so a
//! reader always sees a whole target, never half of an update.
//!
//! The persisted form is one `"<domain> <port>"` pair per line.

use crate::error::RouteError;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONFIG_DIR_NAME: &str = "core-web-server";
const ROUTES_FILE_NAME: &str = "forward_targets.txt";

/// One routing rule: requests for `domain` go to `localhost:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub domain: String,
    pub port: u16,
}

impl ForwardTarget {
    pub fn new(domain: impl Into<String>, port: u16) -> Self {
        Self {
            domain: domain.into(),
            port,
        }
    }

    /// Parse a `"<domain> <port>"` pair
    pub fn parse(line: &str) -> Result<Self, RouteError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [domain, port] = fields.as_slice() else {
            return Err(RouteError::FieldCount(fields.len()));
        };

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| RouteError::InvalidPort(port.to_string()))?;

        Ok(Self::new(*domain, port))
    }
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.domain, self.port)
    }
}

/// Ordered set of targets with unique domains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    targets: Vec<ForwardTarget>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a snapshot. Lines that do not parse are skipped with a warning.
    pub fn parse(snapshot: &str) -> Self {
        let mut table = Self::new();

        for (index, line) in snapshot.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match ForwardTarget::parse(line) {
                Ok(target) => {
                    // parse never yields an empty domain
                    let _ = table.upsert(target);
                }
                Err(e) => warn!("Skipping routes line {}: {:?}: {}", index + 1, line, e),
            }
        }

        table
    }

    pub fn serialize(&self) -> String {
        self.targets
            .iter()
            .map(ForwardTarget::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Insert a target, or overwrite the port of the existing target for the same domain
    pub fn upsert(&mut self, target: ForwardTarget) -> Result<(), RouteError> {
        if target.domain.is_empty() {
            return Err(RouteError::EmptyDomain);
        }

        match self.targets.iter_mut().find(|t| t.domain == target.domain) {
            Some(existing) => existing.port = target.port,
            None => self.targets.push(target),
        }

        Ok(())
    }

    pub fn remove(&mut self, domain: &str) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| t.domain != domain);
        self.targets.len() != before
    }

    pub fn lookup(&self, domain: &str) -> Option<u16> {
        self.targets
            .iter()
            .find(|t| t.domain == domain)
            .map(|t| t.port)
    }

    pub fn targets(&self) -> &[ForwardTarget] {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Shared, persisted routing table
///
/// Cloning is cheap; all clones see the same table.
#[derive(Clone, Default)]
pub struct Routes {
    table: Arc<RwLock<RouteTable>>,
    /// Serializes writers so snapshots hit the disk in the order they were applied
    writer: Arc<Mutex<()>>,
    snapshot_path: Option<Arc<PathBuf>>,
}

impl Routes {
    /// A table that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the table from `path` if it exists; later updates are written back there
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let table = match fs::read_to_string(&path) {
            Ok(snapshot) => RouteTable::parse(&snapshot),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No routes file at {}, starting empty", path.display());
                RouteTable::new()
            }
            Err(e) => {
                warn!("Could not read routes file {}: {}", path.display(), e);
                RouteTable::new()
            }
        };

        info!("Using routes file: {}", path.display());
        for target in table.targets() {
            info!("Serving http://{} -> localhost:{}", target.domain, target.port);
        }

        Self {
            table: Arc::new(RwLock::new(table)),
            writer: Arc::new(Mutex::new(())),
            snapshot_path: Some(Arc::new(path)),
        }
    }

    pub fn lookup(&self, domain: &str) -> Option<u16> {
        self.table.read().lookup(domain)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.lookup(domain).is_some()
    }

    /// Copy of the current table
    pub fn snapshot(&self) -> RouteTable {
        self.table.read().clone()
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref().map(PathBuf::as_path)
    }

    /// Insert or overwrite the route for `domain`, then persist the whole table
    pub fn upsert(&self, domain: &str, port: u16) -> Result<(), RouteError> {
        let _writer = self.writer.lock();

        let snapshot = {
            let mut table = self.table.write();
            table.upsert(ForwardTarget::new(domain, port))?;
            table.serialize()
        };

        info!("Serving http://{} -> localhost:{}", domain, port);
        self.persist(&snapshot);
        Ok(())
    }

    /// Drop the route for `domain`. Returns false if there was none.
    pub fn remove(&self, domain: &str) -> bool {
        let _writer = self.writer.lock();

        let snapshot = {
            let mut table = self.table.write();
            if !table.remove(domain) {
                return false;
            }
            table.serialize()
        };

        info!("No longer serving http://{}", domain);
        self.persist(&snapshot);
        true
    }

    fn persist(&self, snapshot: &str) {
        let Some(path) = self.snapshot_path.as_deref() else {
            return;
        };

        debug!("Updating routes file {}", path.display());
        if let Err(e) = write_atomically(path, snapshot) {
            warn!("Failed to write routes file {}: {}", path.display(), e);
        }
    }
}

/// `<user config dir>/core-web-server/forward_targets.txt`
pub fn default_routes_file() -> Option<PathBuf> {
    dirs_next::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(ROUTES_FILE_NAME))
}

fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

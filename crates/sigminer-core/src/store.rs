//! CSV contact list merged across runs
//!
//! The file is read once at the start of a run and rewritten in full at the
//! end. Rows are shared with the extraction tasks through one async lock per
//! sender address, so two emails from the same sender update the row one
//! after another.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::Contact;
use crate::EMAIL_ADDRESS_COLUMN;

/// Handle to one contact row
pub type ContactEntry = Arc<Mutex<Contact>>;

#[derive(Default)]
struct Rows {
    /// Addresses in file order, then in creation order
    order: Vec<String>,
    by_address: HashMap<String, ContactEntry>,
}

/// In-memory contact set for one run
pub struct ContactStore {
    path: PathBuf,
    headers: Vec<String>,
    rows: RwLock<Rows>,
}

impl ContactStore {
    /// Empty store that will be written to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            headers: Vec::new(),
            rows: RwLock::new(Rows::default()),
        }
    }

    /// Load previously exported contacts.
    ///
    /// A missing or empty file gives an empty store. A file that cannot be
    /// parsed is logged and also gives an empty store; it is replaced at the
    /// end of a successful run.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);
        match read_contacts(&store.path) {
            Ok(Some((headers, contacts))) => {
                info!(
                    "Loaded {} existing contacts from {}",
                    contacts.len(),
                    store.path.display()
                );
                store.headers = headers;
                let rows = store.rows.get_mut();
                for contact in contacts {
                    let address = contact.email_address().to_string();
                    let entry = Arc::new(Mutex::new(contact));
                    // Later rows for the same address replace earlier ones
                    if rows.by_address.insert(address.clone(), entry).is_none() {
                        rows.order.push(address);
                    }
                }
            }
            Ok(None) => {
                debug!("No existing contacts at {}", store.path.display());
            }
            Err(e) => {
                warn!("{}; starting with an empty contact list", e);
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header row of the loaded file
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row for an address, created empty on first use
    pub fn entry(&self, address: &str) -> ContactEntry {
        if let Some(entry) = self.rows.read().by_address.get(address) {
            return Arc::clone(entry);
        }

        let mut rows = self.rows.write();
        if let Some(entry) = rows.by_address.get(address) {
            return Arc::clone(entry);
        }
        let entry = Arc::new(Mutex::new(Contact::new(address)));
        rows.by_address.insert(address.to_string(), Arc::clone(&entry));
        rows.order.push(address.to_string());
        entry
    }

    pub fn get(&self, address: &str) -> Option<ContactEntry> {
        self.rows.read().by_address.get(address).cloned()
    }

    /// Output header: the sender address, every known column, then any
    /// configured field not seen before
    pub fn fieldnames(&self, configured: &[String]) -> Vec<String> {
        let mut fieldnames = vec![EMAIL_ADDRESS_COLUMN.to_string()];
        for name in self.headers.iter().chain(configured) {
            if !fieldnames.contains(name) {
                fieldnames.push(name.clone());
            }
        }
        fieldnames
    }

    /// Copy of every row in output order
    pub async fn snapshot(&self) -> Vec<Contact> {
        let entries: Vec<ContactEntry> = {
            let rows = self.rows.read();
            rows.order
                .iter()
                .filter_map(|address| rows.by_address.get(address).cloned())
                .collect()
        };

        let mut contacts = Vec::with_capacity(entries.len());
        for entry in entries {
            contacts.push(entry.lock().await.clone());
        }
        contacts
    }

    /// Rewrite the destination file with every row
    pub async fn write(&self, fieldnames: &[String]) -> Result<()> {
        let contacts = self.snapshot().await;
        write_contacts(&self.path, &contacts, fieldnames)?;
        info!(
            "Wrote {} contacts to {}",
            contacts.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Read a contact file. `Ok(None)` when there is nothing to read.
pub fn read_contacts(path: &Path) -> Result<Option<(Vec<String>, Vec<Contact>)>> {
    let malformed = |reason: String| Error::MalformedStore {
        path: path.display().to_string(),
        reason,
    };

    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(malformed(e.to_string())),
    };
    if file.metadata().map(|m| m.len() == 0).unwrap_or(false) {
        return Ok(None);
    }

    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| malformed(e.to_string()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Ok(None);
    }
    if !headers.iter().any(|h| h == EMAIL_ADDRESS_COLUMN) {
        return Err(malformed(format!("no {} column", EMAIL_ADDRESS_COLUMN)));
    }

    let mut contacts = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(e.to_string()))?;
        match Contact::from_record(headers.iter().map(String::as_str), record.iter()) {
            Some(contact) => contacts.push(contact),
            None => debug!("Skipping row without an address in {}", path.display()),
        }
    }

    Ok(Some((headers, contacts)))
}

/// Write contacts to `path` through a temporary file in the same directory,
/// renamed over the destination once complete
pub fn write_contacts(path: &Path, contacts: &[Contact], fieldnames: &[String]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = NamedTempFile::new_in(&dir)?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        writer.write_record(fieldnames)?;
        for contact in contacts {
            writer.write_record(contact.to_row(fieldnames))?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.csv");

        let store = ContactStore::new(&path);
        store.entry("x@y.com").lock().await.set("company", "Acme");
        store.write(&names(&["email_address", "company"])).await.unwrap();

        let reloaded = ContactStore::load(&path);
        assert_eq!(reloaded.headers(), names(&["email_address", "company"]).as_slice());
        let contacts = reloaded.snapshot().await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].email_address(), "x@y.com");
        assert_eq!(contacts[0].get("company"), Some("Acme"));
    }

    #[tokio::test]
    async fn test_header_superset_is_kept() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.csv");
        std::fs::write(
            &path,
            "company,email_address,notes\nAcme,x@y.com,met at fair\n",
        )
        .unwrap();

        let store = ContactStore::load(&path);
        let fieldnames = store.fieldnames(&names(&["company", "job_title"]));
        assert_eq!(
            fieldnames,
            names(&["email_address", "company", "notes", "job_title"])
        );

        store.write(&fieldnames).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "email_address,company,notes,job_title\nx@y.com,Acme,met at fair,\n"
        );
    }

    #[test]
    fn test_missing_and_empty_files_start_empty() {
        let dir = TempDir::new().unwrap();
        let missing = ContactStore::load(dir.path().join("missing.csv"));
        assert!(missing.is_empty());
        assert!(missing.headers().is_empty());

        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "").unwrap();
        assert!(ContactStore::load(&path).is_empty());
    }

    #[test]
    fn test_malformed_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.csv");
        std::fs::write(&path, "name,company\nAda,Acme\n").unwrap();

        assert!(matches!(
            read_contacts(&path),
            Err(Error::MalformedStore { .. })
        ));
        assert!(ContactStore::load(&path).is_empty());
    }

    #[tokio::test]
    async fn test_entry_is_shared_per_address() {
        let store = ContactStore::new("unused.csv");
        let first = store.entry("x@y.com");
        let second = store.entry("x@y.com");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.len(), 1);

        first.lock().await.set("company", "Acme");
        assert_eq!(second.lock().await.get("company"), Some("Acme"));
        assert!(store.get("other@y.com").is_none());
    }

    #[tokio::test]
    async fn test_rows_keep_file_order_and_missing_cells_are_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("contacts.csv");
        std::fs::write(&path, "email_address,company\nb@y.com,Beta\na@y.com,0\n").unwrap();

        let store = ContactStore::load(&path);
        store.entry("c@y.com").lock().await.set("job_title", "CTO");
        let fieldnames = store.fieldnames(&names(&["company", "job_title"]));
        store.write(&fieldnames).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "email_address,company,job_title\nb@y.com,Beta,\na@y.com,0,\nc@y.com,,CTO\n"
        );

        // Only the destination remains in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}

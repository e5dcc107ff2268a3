//! Contact resolution cache.
//!
//! Contacts live in memory, keyed by id and kept in insertion order, with
//! phone and email indices that are rebuilt from the map after every
//! mutation. Every mutation rewrites the
//! backing JSON file. One cache instance is created at startup and shared by
//! reference.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::models::{Contact, ContactResolution, ContactUpsert};

/// Normalize a phone number for lookup: keep a leading `+`, then digits only.
#[must_use]
pub fn normalize_phone(phone: &str) -> String {
    let phone = phone.trim();
    let digits = phone.chars().filter(char::is_ascii_digit);
    if phone.starts_with('+') {
        std::iter::once('+').chain(digits).collect()
    } else {
        digits.collect()
    }
}

/// Normalize an email for lookup.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn phone_key(phone: &str) -> Option<String> {
    let key = normalize_phone(phone);
    (!key.is_empty() && key != "+").then_some(key)
}

fn email_key(email: &str) -> Option<String> {
    let key = normalize_email(email);
    (!key.is_empty()).then_some(key)
}

#[derive(Debug, Default)]
struct Store {
    contacts: HashMap<String, Contact>,
    order: Vec<String>,
    phone_index: HashMap<String, String>,
    email_index: HashMap<String, String>,
}

impl Store {
    fn from_contacts(contacts: Vec<Contact>) -> Self {
        let mut store = Self::default();
        for contact in contacts {
            store.insert(contact);
        }
        store.rebuild_indices();
        store
    }

    /// Contacts in insertion order.
    fn values(&self) -> impl Iterator<Item = &Contact> {
        self.order.iter().filter_map(|id| self.contacts.get(id))
    }

    fn insert(&mut self, contact: Contact) {
        if !self.contacts.contains_key(&contact.id) {
            self.order.push(contact.id.clone());
        }
        self.contacts.insert(contact.id.clone(), contact);
    }

    fn remove(&mut self, id: &str) -> Option<Contact> {
        let removed = self.contacts.remove(id)?;
        self.order.retain(|o| o != id);
        Some(removed)
    }

    fn clear(&mut self) {
        self.contacts.clear();
        self.order.clear();
    }

    /// On a shared key the earliest inserted contact keeps it.
    fn rebuild_indices(&mut self) {
        let mut phone_index = HashMap::new();
        let mut email_index = HashMap::new();
        for contact in self.values() {
            for key in contact.phones.iter().filter_map(|p| phone_key(p)) {
                phone_index.entry(key).or_insert_with(|| contact.id.clone());
            }
            for key in contact.emails.iter().filter_map(|e| email_key(e)) {
                email_index.entry(key).or_insert_with(|| contact.id.clone());
            }
        }
        self.phone_index = phone_index;
        self.email_index = email_index;
    }

    fn by_phone(&self, phone: &str) -> Option<&Contact> {
        phone_key(phone)
            .and_then(|key| self.phone_index.get(&key))
            .and_then(|id| self.contacts.get(id))
    }

    fn by_email(&self, email: &str) -> Option<&Contact> {
        email_key(email)
            .and_then(|key| self.email_index.get(&key))
            .and_then(|id| self.contacts.get(id))
    }
}

fn resolution(mut matches: Vec<&Contact>) -> Option<ContactResolution> {
    match matches.len() {
        0 => None,
        1 => matches.pop().map(|c| ContactResolution::Ok { contact: c.clone() }),
        _ => Some(ContactResolution::Ambiguous {
            candidates: matches.into_iter().cloned().collect(),
        }),
    }
}

/// In-memory contact store with JSON file persistence.
#[derive(Debug)]
pub struct ContactCache {
    path: PathBuf,
    store: RwLock<Store>,
    metrics: MetricsCollector,
}

impl ContactCache {
    /// Open the cache backed by `path`. A missing file starts empty; an
    /// unreadable or corrupt file is logged and also starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let contacts = Self::load(&path);
        let cache = Self {
            path,
            store: RwLock::new(Store::from_contacts(contacts)),
            metrics: MetricsCollector::default(),
        };
        cache.metrics.set_contacts_cached(cache.len());
        cache
    }

    fn load(path: &Path) -> Vec<Contact> {
        if !path.exists() {
            debug!(path = %path.display(), "Contacts file does not exist");
            return Vec::new();
        }

        let parsed = fs::read_to_string(path)
            .map_err(crate::error::GatewayError::from)
            .and_then(|raw| serde_json::from_str::<Vec<Contact>>(&raw).map_err(Into::into));

        match parsed {
            Ok(contacts) => {
                info!(count = contacts.len(), path = %path.display(), "Loaded contacts");
                contacts
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load contacts, starting empty");
                Vec::new()
            },
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a contact, or merge into the one matching a phone (first) or
    /// an email.
    pub fn upsert(&self, data: ContactUpsert) -> Result<Contact> {
        let mut store = self.write();

        let existing = data
            .phones
            .iter()
            .find_map(|p| store.by_phone(p))
            .or_else(|| data.emails.iter().find_map(|e| store.by_email(e)))
            .map(|c| c.id.clone());

        let contact = match existing.and_then(|id| store.contacts.get_mut(&id)) {
            Some(contact) => {
                contact.merge(data);
                debug!(id = %contact.id, "Merged contact");
                contact.clone()
            },
            None => {
                let contact = Contact::new(data);
                debug!(id = %contact.id, "Created contact");
                store.insert(contact.clone());
                contact
            },
        };

        store.rebuild_indices();
        self.persist(&store)?;
        Ok(contact)
    }

    /// Contact by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Contact> {
        self.read().contacts.get(id).cloned()
    }

    /// Resolve by phone, then email, then exact name, then name/alias
    /// substring. Blank keys are ignored.
    #[must_use]
    pub fn resolve(&self, phone: Option<&str>, email: Option<&str>, name: Option<&str>) -> ContactResolution {
        let store = self.read();
        let result = Self::resolve_in(&store, phone, email, name);
        self.metrics.record_contact_resolution(result.status());
        result
    }

    fn resolve_in(store: &Store, phone: Option<&str>, email: Option<&str>, name: Option<&str>) -> ContactResolution {
        if let Some(contact) = phone.and_then(|p| store.by_phone(p)) {
            return ContactResolution::Ok {
                contact: contact.clone(),
            };
        }

        if let Some(contact) = email.and_then(|e| store.by_email(e)) {
            return ContactResolution::Ok {
                contact: contact.clone(),
            };
        }

        let Some(needle) = name.map(|n| n.trim().to_lowercase()).filter(|n| !n.is_empty()) else {
            return ContactResolution::NotFound;
        };

        let exact = store
            .values()
            .filter(|c| c.name.as_deref().is_some_and(|n| n.to_lowercase() == needle))
            .collect();
        if let Some(found) = resolution(exact) {
            return found;
        }

        let partial = store
            .values()
            .filter(|c| {
                c.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&needle))
                    || c.aliases.iter().any(|a| a.to_lowercase().contains(&needle))
            })
            .collect();
        resolution(partial).unwrap_or(ContactResolution::NotFound)
    }

    /// Case-insensitive substring search over names, aliases, phones and
    /// emails. Each contact appears at most once.
    #[must_use]
    pub fn search(&self, query: &str, limit: usize) -> Vec<Contact> {
        let needle = query.to_lowercase();
        self.read()
            .values()
            .filter(|c| {
                c.name.as_deref().is_some_and(|n| n.to_lowercase().contains(&needle))
                    || c.aliases.iter().any(|a| a.to_lowercase().contains(&needle))
                    || c.phones.iter().any(|p| p.contains(query))
                    || c.emails.iter().any(|e| e.to_lowercase().contains(&needle))
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// Remove a contact. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut store = self.write();
        if store.remove(id).is_none() {
            return Ok(false);
        }
        store.rebuild_indices();
        self.persist(&store)?;
        Ok(true)
    }

    /// Every contact, in insertion order.
    #[must_use]
    pub fn list_all(&self) -> Vec<Contact> {
        self.read().values().cloned().collect()
    }

    /// Remove every contact.
    pub fn clear(&self) -> Result<()> {
        let mut store = self.write();
        store.clear();
        store.rebuild_indices();
        self.persist(&store)
    }

    /// Number of cached contacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().contacts.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, store: &Store) -> Result<()> {
        let contacts: Vec<&Contact> = store.values().collect();
        let result = write_private(&self.path, &serde_json::to_vec_pretty(&contacts)?);
        match &result {
            Ok(()) => debug!(count = contacts.len(), path = %self.path.display(), "Saved contacts"),
            Err(e) => error!(path = %self.path.display(), error = %e, "Failed to save contacts"),
        }
        self.metrics.set_contacts_cached(contacts.len());
        result
    }
}

/// Write `bytes` to `path` through a temp file and rename, owner-only.
fn write_private(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    let mut tmp_name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

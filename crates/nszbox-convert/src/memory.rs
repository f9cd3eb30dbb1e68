//! In-memory reference resolver with fault injection, for hosts without a
//! filesystem and for exercising the pipeline's failure paths.

use crate::error::ResolverError;
use crate::reference::{Reference, ReferenceResolver};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Entry {
    data: Vec<u8>,
    display_name: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    files: BTreeMap<Reference, Entry>,
    folders: BTreeSet<Reference>,
    fail_creates: bool,
    fail_deletes: bool,
    read_faults: BTreeMap<Reference, usize>,
    write_faults: BTreeMap<Reference, usize>,
    deletions: Vec<Reference>,
}

/// Thread-safe in-memory resolver. Clones share the same backing store.
#[derive(Debug, Clone, Default)]
pub struct MemoryResolver {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryResolver {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a folder that children can be created in.
    pub fn add_folder(&self, folder: impl Into<Reference>) -> Reference {
        let folder = folder.into();
        self.lock().folders.insert(folder.clone());
        folder
    }

    /// Remove a folder, making child creation in it fail as stale.
    pub fn remove_folder(&self, folder: &Reference) {
        self.lock().folders.remove(folder);
    }

    /// Store a file without name metadata.
    pub fn insert_file(&self, reference: impl Into<Reference>, data: Vec<u8>) -> Reference {
        let reference = reference.into();
        self.lock().files.insert(reference.clone(), Entry { data, display_name: None });
        reference
    }

    /// Store a file whose metadata reports `display_name`.
    pub fn insert_named_file(
        &self,
        reference: impl Into<Reference>,
        display_name: &str,
        data: Vec<u8>,
    ) -> Reference {
        let reference = reference.into();
        self.lock().files.insert(
            reference.clone(),
            Entry { data, display_name: Some(display_name.to_string()) },
        );
        reference
    }

    /// Current content of a file.
    pub fn contents(&self, reference: &Reference) -> Option<Vec<u8>> {
        self.lock().files.get(reference).map(|e| e.data.clone())
    }

    /// True if the file exists.
    pub fn exists(&self, reference: &Reference) -> bool {
        self.lock().files.contains_key(reference)
    }

    /// Files created directly inside `folder`.
    pub fn children(&self, folder: &Reference) -> Vec<Reference> {
        let prefix = format!("{}/", folder);
        self.lock()
            .files
            .keys()
            .filter(|r| r.as_str().strip_prefix(&prefix).is_some_and(|rest| !rest.contains('/')))
            .cloned()
            .collect()
    }

    /// Every delete call issued so far, successful or not.
    pub fn deletions(&self) -> Vec<Reference> {
        self.lock().deletions.clone()
    }

    /// Make every subsequent `create_child` fail.
    pub fn fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Make every subsequent `delete` fail.
    pub fn fail_deletes(&self, fail: bool) {
        self.lock().fail_deletes = fail;
    }

    /// Fail reads of `reference` with an I/O error once `after` bytes were served.
    pub fn fail_reads_after(&self, reference: &Reference, after: usize) {
        self.lock().read_faults.insert(reference.clone(), after);
    }

    /// Fail writes into `reference` once `after` bytes were accepted.
    pub fn fail_writes_after(&self, reference: &Reference, after: usize) {
        self.lock().write_faults.insert(reference.clone(), after);
    }

    fn child_reference(folder: &Reference, name: &str) -> Reference {
        Reference::new(format!("{}/{}", folder, name))
    }
}

fn missing(reference: &Reference) -> ResolverError {
    ResolverError::ReferenceUnavailable(format!("{}: no such resource", reference))
}

struct FaultyReader {
    data: Cursor<Vec<u8>>,
    budget: usize,
}

impl Read for FaultyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated read failure"));
        }
        let limit = buf.len().min(self.budget);
        let n = self.data.read(&mut buf[..limit])?;
        if n == 0 {
            return Ok(0);
        }
        self.budget -= n;
        Ok(n)
    }
}

struct MemoryWriter {
    inner: Arc<Mutex<Inner>>,
    target: Reference,
    budget: Option<usize>,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let accepted = match self.budget {
            Some(0) => return Err(io::Error::other("simulated write failure")),
            Some(left) => buf.len().min(left),
            None => buf.len(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .files
            .get_mut(&self.target)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "resource deleted while open"))?;
        entry.data.extend_from_slice(&buf[..accepted]);
        if let Some(left) = self.budget.as_mut() {
            *left -= accepted;
        }
        Ok(accepted)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ReferenceResolver for MemoryResolver {
    fn display_name(&self, reference: &Reference) -> Result<Option<String>, ResolverError> {
        let inner = self.lock();
        let entry = inner.files.get(reference).ok_or_else(|| missing(reference))?;
        Ok(entry.display_name.clone())
    }

    fn open_read(&self, reference: &Reference) -> Result<Box<dyn Read + Send>, ResolverError> {
        let inner = self.lock();
        let entry = inner.files.get(reference).ok_or_else(|| missing(reference))?;
        let data = Cursor::new(entry.data.clone());
        match inner.read_faults.get(reference) {
            Some(&budget) => Ok(Box::new(FaultyReader { data, budget })),
            None => Ok(Box::new(data)),
        }
    }

    fn open_write(&self, reference: &Reference) -> Result<Box<dyn Write + Send>, ResolverError> {
        let mut inner = self.lock();
        let entry = inner.files.get_mut(reference).ok_or_else(|| missing(reference))?;
        entry.data.clear();
        let budget = inner.write_faults.get(reference).copied();
        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            target: reference.clone(),
            budget,
        }))
    }

    fn create_child(
        &self,
        folder: &Reference,
        _mime_hint: &str,
        name: &str,
    ) -> Result<Reference, ResolverError> {
        let mut inner = self.lock();
        if inner.fail_creates {
            return Err(ResolverError::CreateFailed(format!("{}: simulated create failure", name)));
        }
        if !inner.folders.contains(folder) {
            return Err(ResolverError::CreateFailed(format!("folder {} is stale", folder)));
        }
        let mut child = Self::child_reference(folder, name);
        let mut n = 1;
        while inner.files.contains_key(&child) {
            child = Self::child_reference(folder, &format!("{} ({})", name, n));
            n += 1;
        }
        inner.files.insert(
            child.clone(),
            Entry { data: Vec::new(), display_name: Some(name.to_string()) },
        );
        Ok(child)
    }

    fn delete(&self, reference: &Reference) -> Result<(), ResolverError> {
        let mut inner = self.lock();
        inner.deletions.push(reference.clone());
        if inner.fail_deletes {
            return Err(ResolverError::DeletionFailed(format!(
                "{}: simulated delete failure",
                reference
            )));
        }
        inner
            .files
            .remove(reference)
            .map(|_| ())
            .ok_or_else(|| ResolverError::DeletionFailed(format!("{}: no such resource", reference)))
    }
}

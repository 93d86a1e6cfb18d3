//! Per-run state shared by the passes.
//!
//! The context is created once per protection run and discarded after the
//! module is written. The module graph itself travels beside the context
//! (passes receive `&mut Module` and `&mut ProtectionContext` separately),
//! which keeps borrows simple and makes [`ProtectionContext::fork`] cheap:
//! a fork copies the run state while the module stays where it is.

use crate::diagnostics::{Diagnostic, Severity};
use crate::error::ProtectionError;
use crate::module::{FieldId, Module, TypeId};
use crate::random::RandomSource;
use modshield_config::{EncryptionAlgorithm, ProtectionConfig};
use std::collections::{BTreeSet, HashMap};

/// Association from pre-transform fully-qualified names to post-transform
/// names. Keys are unique; insertion order is kept for the mapping file.
#[derive(Debug, Default, Clone)]
pub struct RenameMap {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl RenameMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rename. Returns false (and changes nothing) when the
    /// original name was already recorded.
    pub fn insert(&mut self, original: impl Into<String>, renamed: impl Into<String>) -> bool {
        let original = original.into();
        if self.index.contains_key(&original) {
            return false;
        }
        self.index.insert(original.clone(), self.entries.len());
        self.entries.push((original, renamed.into()));
        true
    }

    pub fn get(&self, original: &str) -> Option<&str> {
        self.index
            .get(original)
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, original: &str) -> bool {
        self.index.contains_key(original)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(o, n)| (o.as_str(), n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One encrypted literal.
#[derive(Debug, Clone)]
pub struct EncryptedString {
    pub plaintext: String,
    pub ciphertext: Vec<u8>,
    pub key: Vec<u8>,
    pub algorithm: EncryptionAlgorithm,
    /// Static field carrying the ciphertext, set during injection.
    pub data_field: Option<FieldId>,
    /// Static field carrying the per-literal key under dynamic decryption.
    pub key_field: Option<FieldId>,
}

/// Registry of encrypted literals, keyed by original value so repeated
/// occurrences share one ciphertext.
#[derive(Debug, Default, Clone)]
pub struct StringRegistry {
    records: Vec<EncryptedString>,
    index: HashMap<String, usize>,
}

impl StringRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the record for `plaintext`, inserting with `make` when absent.
    pub fn intern(
        &mut self,
        plaintext: &str,
        make: impl FnOnce() -> EncryptedString,
    ) -> usize {
        if let Some(&i) = self.index.get(plaintext) {
            return i;
        }
        let i = self.records.len();
        self.records.push(make());
        self.index.insert(plaintext.to_owned(), i);
        i
    }

    pub fn get(&self, index: usize) -> &EncryptedString {
        &self.records[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut EncryptedString {
        &mut self.records[index]
    }

    pub fn lookup(&self, plaintext: &str) -> Option<&EncryptedString> {
        self.index.get(plaintext).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[EncryptedString] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [EncryptedString] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Centralised exclusion rules. Passes consult this before mutating a
/// member.
#[derive(Debug, Clone)]
pub struct PreservationPolicy {
    prefixes: Vec<String>,
    excluded_namespaces: BTreeSet<String>,
    excluded_types: BTreeSet<String>,
    excluded_methods: BTreeSet<String>,
    preserve_public_api: bool,
    preserve_custom_attributes: bool,
}

impl PreservationPolicy {
    pub fn from_config(config: &ProtectionConfig) -> Self {
        Self {
            prefixes: config.preserved_prefixes.clone(),
            excluded_namespaces: config.excluded_namespaces.clone(),
            excluded_types: config.excluded_types.clone(),
            excluded_methods: config.excluded_methods.clone(),
            preserve_public_api: config.preserve_public_api,
            preserve_custom_attributes: config.preserve_custom_attributes,
        }
    }

    /// Framework surface by full-name prefix (`System.`, `Microsoft.`, ...).
    pub fn is_framework_name(&self, full_name: &str) -> bool {
        self.prefixes.iter().any(|p| full_name.starts_with(p))
    }

    pub fn preserve_public_api(&self) -> bool {
        self.preserve_public_api
    }

    pub fn preserve_attributes(&self) -> bool {
        self.preserve_custom_attributes
    }

    /// Whether the type itself is off limits (framework prefix or explicit
    /// exclusion of its namespace or full name).
    pub fn type_excluded(&self, module: &Module, id: TypeId) -> bool {
        let full = module.type_full_name(id);
        let ty = module.type_def(id);
        self.is_framework_name(&full) || self.type_excluded_by_name(&full, &ty.namespace)
    }

    /// Name-based variant for callers holding a pre-transform snapshot.
    pub fn type_excluded_by_name(&self, full_name: &str, namespace: &str) -> bool {
        self.excluded_types.contains(full_name) || self.excluded_namespaces.contains(namespace)
    }

    pub fn method_excluded(&self, full_name: &str) -> bool {
        self.excluded_methods.contains(full_name)
    }
}

/// The per-run context handed to every pass.
#[derive(Debug)]
pub struct ProtectionContext {
    pub config: ProtectionConfig,
    pub rng: RandomSource,
    pub preservation: PreservationPolicy,
    pub rename_map: RenameMap,
    pub strings: StringRegistry,
    diagnostics: Vec<Diagnostic>,
    applied: BTreeSet<String>,
}

impl ProtectionContext {
    /// Fails when the configuration lacks an output path; a run cannot
    /// proceed without one.
    pub fn new(config: ProtectionConfig) -> Result<Self, ProtectionError> {
        if config.output_path.is_none() {
            return Err(ProtectionError::MissingOutputPath);
        }
        let rng = RandomSource::new(config.seed);
        let preservation = PreservationPolicy::from_config(&config);
        Ok(Self {
            config,
            rng,
            preservation,
            rename_map: RenameMap::new(),
            strings: StringRegistry::new(),
            diagnostics: Vec::new(),
            applied: BTreeSet::new(),
        })
    }

    /// Idempotent: marking twice is fine.
    pub fn mark_applied(&mut self, pass_id: &str) {
        self.applied.insert(pass_id.to_owned());
    }

    pub fn is_applied(&self, pass_id: &str) -> bool {
        self.applied.contains(pass_id)
    }

    pub fn applied(&self) -> impl Iterator<Item = &str> {
        self.applied.iter().map(String::as_str)
    }

    pub fn add_diagnostic(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn info(&mut self, code: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::info(code, message));
    }

    pub fn warning(&mut self, code: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::warning(code, message));
    }

    pub fn error(&mut self, code: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(code, message));
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Child context for speculative execution: copies of the run state,
    /// sharing nothing mutably. Mutations on the child do not propagate
    /// back; the module itself travels beside the context and is shared by
    /// construction.
    pub fn fork(&self) -> Self {
        Self {
            config: self.config.clone(),
            rng: self.rng.clone(),
            preservation: self.preservation.clone(),
            rename_map: self.rename_map.clone(),
            strings: self.strings.clone(),
            diagnostics: self.diagnostics.clone(),
            applied: self.applied.clone(),
        }
    }
}

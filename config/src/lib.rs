//! `modshield-config` provides the Rust data structures used for serializing and deserializing
//! ModShield YAML configuration files and for constructing protection runs programmatically.
//! These structures are consumed by both the ModShield CLI and the core pipeline.
//!
//! This crate is intended to be consumed by tools that integrate with or generate ModShield
//! config files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Current supported YAML config version.
pub const YAML_CONFIG_VERSION: &str = "1.0.2";

/// Coarse protection presets selectable from the command line.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ProtectionLevel {
    /// Every pass disabled; the pipeline is a pass-through.
    None,
    /// Light renaming and the watermark only.
    Minimal,
    /// Renaming, string encryption, moderate control-flow flattening.
    #[default]
    Balanced,
    /// Everything on, at the heaviest per-pass settings.
    Aggressive,
}

/// Identifier-rewriting intensity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum RenamingMode {
    None,
    Light,
    #[default]
    Normal,
    Aggressive,
}

/// Cosmetic shape of minted identifiers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum NamingScheme {
    /// `[A-Za-z0-9]`, first char `[A-Za-z_]`.
    #[default]
    Alphanumeric,
    /// Drawn from the visually confusable set `l I 1 i |`.
    Confusable,
    /// Leading underscore followed by zero-width code points.
    Invisible,
    /// Lowercase Latin letters only.
    Simple,
}

/// Control-flow flattening intensity.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ControlFlowMode {
    None,
    Light,
    #[default]
    Normal,
    Heavy,
    Extreme,
}

/// String-literal encryption algorithm.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256 in counter mode with a SHA-256 derived key and a zero IV.
    #[default]
    SymmetricBlock,
    /// ChaCha20 keystream XOR.
    Stream,
    /// Positional XOR mixing, cheap but self-contained.
    Custom,
}

/// Anti-tamper aggressiveness.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum AntiTamperMode {
    None,
    #[default]
    Light,
    Normal,
    Heavy,
}

/// Post-pass peephole optimization level applied by the finalizer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum OptimizationLevel {
    None,
    Minimal,
    #[default]
    Balanced,
    Aggressive,
}

/// How much of the run is allowed to surface raw failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
pub enum DebugMode {
    /// Failures inside passes are converted to diagnostics.
    #[default]
    None,
    /// As `None`, but debug symbols are kept in the output.
    SymbolsOnly,
    /// Pass failures propagate out of the orchestrator unchanged.
    Full,
}

/// Settings for the identifier-renaming pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenamingSettings {
    /// Renaming intensity.
    #[serde(default)]
    pub mode: RenamingMode,
    /// Cosmetic scheme for minted names.
    #[serde(default)]
    pub scheme: NamingScheme,
    /// Whether fields are renamed.
    #[serde(default = "default_true")]
    pub rename_fields: bool,
    /// Whether properties (and their accessors) are renamed.
    #[serde(default = "default_true")]
    pub rename_properties: bool,
    /// Whether events (and their accessors) are renamed.
    #[serde(default = "default_true")]
    pub rename_events: bool,
    /// Whether enum members are renamed.
    #[serde(default)]
    pub rename_enum_members: bool,
    /// Collapse all namespaces into one.
    #[serde(default)]
    pub flatten_namespaces: bool,
    /// Replacement namespace used when flattening. Empty means the unnamed namespace.
    #[serde(default)]
    pub namespace_prefix: String,
    /// Emit a textual old-name -> new-name mapping file beside the output.
    #[serde(default)]
    pub generate_mapping_file: bool,
}

impl Default for RenamingSettings {
    fn default() -> Self {
        Self {
            mode: RenamingMode::default(),
            scheme: NamingScheme::default(),
            rename_fields: true,
            rename_properties: true,
            rename_events: true,
            rename_enum_members: false,
            flatten_namespaces: false,
            namespace_prefix: String::new(),
            generate_mapping_file: false,
        }
    }
}

/// Settings for the control-flow flattening pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFlowSettings {
    /// Flattening intensity.
    #[serde(default)]
    pub mode: ControlFlowMode,
    /// Minimum instruction count before a body is worth flattening.
    #[serde(default = "default_complexity_threshold")]
    pub complexity_threshold: u32,
    /// Insert opaque-predicate junk blocks between real blocks.
    #[serde(default)]
    pub insert_junk_blocks: bool,
    /// Reserved: split oversized methods before flattening.
    #[serde(default)]
    pub split_methods: bool,
}

impl Default for ControlFlowSettings {
    fn default() -> Self {
        Self {
            mode: ControlFlowMode::default(),
            complexity_threshold: default_complexity_threshold(),
            insert_junk_blocks: false,
            split_methods: false,
        }
    }
}

/// Settings for the encryption passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionSettings {
    /// Algorithm used for literal encryption.
    #[serde(default)]
    pub algorithm: EncryptionAlgorithm,
    /// Encrypt inline string literals.
    #[serde(default = "default_true")]
    pub encrypt_strings: bool,
    /// Reserved: encrypt whole method bodies.
    #[serde(default)]
    pub encrypt_methods: bool,
    /// Reserved: encrypt embedded resources.
    #[serde(default)]
    pub encrypt_resources: bool,
    /// Ship per-literal keys and decrypt with the two-argument decryptor.
    #[serde(default)]
    pub dynamic_decryption: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::default(),
            encrypt_strings: true,
            encrypt_methods: false,
            encrypt_resources: false,
            dynamic_decryption: false,
        }
    }
}

/// Settings for the anti-debug / anti-tamper pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntiTamperSettings {
    /// Probe density.
    #[serde(default)]
    pub mode: AntiTamperMode,
    /// Bake a module checksum and verify it at startup.
    #[serde(default = "default_true")]
    pub validate_checksum: bool,
    /// Reserved: verify a strong-name style signature.
    #[serde(default)]
    pub validate_signature: bool,
    /// Fault the process on detection instead of exiting cleanly.
    #[serde(default = "default_true")]
    pub corrupt_on_tamper: bool,
}

impl Default for AntiTamperSettings {
    fn default() -> Self {
        Self {
            mode: AntiTamperMode::default(),
            validate_checksum: true,
            validate_signature: false,
            corrupt_on_tamper: true,
        }
    }
}

/// Top-level protection configuration for a single run.
///
/// The `enable_*` switches gate whole passes; the nested settings shape each
/// pass. Switches for passes that are not scheduled yet (virtualization,
/// mutation, constants encoding, resource protection, call indirection, junk
/// code) are recognised and carried so config files round-trip, but schedule
/// nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Rename types, methods, fields, properties and events.
    #[serde(default = "default_true")]
    pub enable_renaming: bool,
    /// Encrypt inline string literals and inject a decryptor.
    #[serde(default = "default_true")]
    pub enable_string_encryption: bool,
    /// Flatten method bodies into dispatched state machines.
    #[serde(default = "default_true")]
    pub enable_control_flow: bool,
    /// Inject debugger-detection probes.
    #[serde(default = "default_true")]
    pub enable_anti_debug: bool,
    /// Inject integrity checks alongside the debugger probes.
    #[serde(default = "default_true")]
    pub enable_anti_tamper: bool,
    /// Stamp the module with a marker attribute.
    #[serde(default = "default_true")]
    pub enable_watermarking: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_virtualization: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_mutation: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_constants_encoding: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_resources_protection: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_call_indirection: bool,
    /// Recognised but not scheduled.
    #[serde(default)]
    pub enable_junk_code: bool,

    /// Renaming pass settings.
    #[serde(default)]
    pub renaming: RenamingSettings,
    /// Control-flow pass settings.
    #[serde(default)]
    pub control_flow: ControlFlowSettings,
    /// Encryption settings.
    #[serde(default)]
    pub encryption: EncryptionSettings,
    /// Anti-tamper settings.
    #[serde(default)]
    pub anti_tamper: AntiTamperSettings,

    /// Namespaces whose members are never touched (exact names).
    #[serde(default)]
    pub excluded_namespaces: BTreeSet<String>,
    /// Full type names that are never touched.
    #[serde(default)]
    pub excluded_types: BTreeSet<String>,
    /// Full method names that are never touched.
    #[serde(default)]
    pub excluded_methods: BTreeSet<String>,
    /// Full-name prefixes treated as framework surface and preserved.
    #[serde(default = "default_preserved_prefixes")]
    pub preserved_prefixes: Vec<String>,

    /// Finalizer peephole level.
    #[serde(default)]
    pub optimization: OptimizationLevel,
    /// Failure-surfacing behaviour.
    #[serde(default)]
    pub debug_mode: DebugMode,
    /// Keep publicly visible names stable.
    #[serde(default = "default_true")]
    pub preserve_public_api: bool,
    /// Keep sequence points in the output.
    #[serde(default)]
    pub preserve_debug_symbols: bool,
    /// Keep pre-existing custom attributes.
    #[serde(default = "default_true")]
    pub preserve_custom_attributes: bool,

    /// Where the protected module is written. Required for a run to proceed.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// Fixed seed for reproducible builds. Unset means entropy-seeded.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enable_renaming: true,
            enable_string_encryption: true,
            enable_control_flow: true,
            enable_anti_debug: true,
            enable_anti_tamper: true,
            enable_watermarking: true,
            enable_virtualization: false,
            enable_mutation: false,
            enable_constants_encoding: false,
            enable_resources_protection: false,
            enable_call_indirection: false,
            enable_junk_code: false,
            renaming: RenamingSettings::default(),
            control_flow: ControlFlowSettings::default(),
            encryption: EncryptionSettings::default(),
            anti_tamper: AntiTamperSettings::default(),
            excluded_namespaces: BTreeSet::new(),
            excluded_types: BTreeSet::new(),
            excluded_methods: BTreeSet::new(),
            preserved_prefixes: default_preserved_prefixes(),
            optimization: OptimizationLevel::default(),
            debug_mode: DebugMode::default(),
            preserve_public_api: true,
            preserve_debug_symbols: false,
            preserve_custom_attributes: true,
            output_path: None,
            seed: None,
        }
    }
}

impl ProtectionConfig {
    /// Start building a configuration programmatically.
    pub fn builder() -> ProtectionConfigBuilder {
        ProtectionConfigBuilder::default()
    }

    /// A configuration preset for the given coarse level.
    pub fn with_level(level: ProtectionLevel) -> Self {
        let mut config = Self::default();
        config.apply_level(level);
        config
    }

    /// Overwrite the pass switches and per-pass intensities from a preset.
    /// Exclusion sets, paths and preservation switches are left alone.
    pub fn apply_level(&mut self, level: ProtectionLevel) {
        match level {
            ProtectionLevel::None => {
                self.enable_renaming = false;
                self.enable_string_encryption = false;
                self.enable_control_flow = false;
                self.enable_anti_debug = false;
                self.enable_anti_tamper = false;
                self.enable_watermarking = false;
            }
            ProtectionLevel::Minimal => {
                self.enable_renaming = true;
                self.enable_string_encryption = false;
                self.enable_control_flow = false;
                self.enable_anti_debug = false;
                self.enable_anti_tamper = false;
                self.enable_watermarking = true;
                self.renaming.mode = RenamingMode::Light;
            }
            ProtectionLevel::Balanced => {
                self.enable_renaming = true;
                self.enable_string_encryption = true;
                self.enable_control_flow = true;
                self.enable_anti_debug = true;
                self.enable_anti_tamper = true;
                self.enable_watermarking = true;
                self.renaming.mode = RenamingMode::Normal;
                self.control_flow.mode = ControlFlowMode::Normal;
                self.anti_tamper.mode = AntiTamperMode::Light;
            }
            ProtectionLevel::Aggressive => {
                self.enable_renaming = true;
                self.enable_string_encryption = true;
                self.enable_control_flow = true;
                self.enable_anti_debug = true;
                self.enable_anti_tamper = true;
                self.enable_watermarking = true;
                self.renaming.mode = RenamingMode::Aggressive;
                self.control_flow.mode = ControlFlowMode::Heavy;
                self.control_flow.insert_junk_blocks = true;
                self.anti_tamper.mode = AntiTamperMode::Heavy;
                self.encryption.dynamic_decryption = true;
            }
        }
    }
}

/// Builder-style construction for [`ProtectionConfig`].
#[derive(Debug, Default)]
pub struct ProtectionConfigBuilder {
    config: ProtectionConfig,
}

impl ProtectionConfigBuilder {
    /// Apply a coarse preset first; later calls refine it.
    pub fn level(mut self, level: ProtectionLevel) -> Self {
        self.config.apply_level(level);
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_path = Some(path.into());
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    pub fn renaming(mut self, enabled: bool) -> Self {
        self.config.enable_renaming = enabled;
        self
    }

    pub fn renaming_mode(mut self, mode: RenamingMode) -> Self {
        self.config.renaming.mode = mode;
        self
    }

    pub fn naming_scheme(mut self, scheme: NamingScheme) -> Self {
        self.config.renaming.scheme = scheme;
        self
    }

    pub fn string_encryption(mut self, enabled: bool) -> Self {
        self.config.enable_string_encryption = enabled;
        self
    }

    pub fn encryption_algorithm(mut self, algorithm: EncryptionAlgorithm) -> Self {
        self.config.encryption.algorithm = algorithm;
        self
    }

    pub fn control_flow(mut self, enabled: bool) -> Self {
        self.config.enable_control_flow = enabled;
        self
    }

    pub fn control_flow_mode(mut self, mode: ControlFlowMode) -> Self {
        self.config.control_flow.mode = mode;
        self
    }

    pub fn anti_debug(mut self, enabled: bool) -> Self {
        self.config.enable_anti_debug = enabled;
        self
    }

    pub fn anti_tamper(mut self, enabled: bool) -> Self {
        self.config.enable_anti_tamper = enabled;
        self
    }

    pub fn watermarking(mut self, enabled: bool) -> Self {
        self.config.enable_watermarking = enabled;
        self
    }

    pub fn exclude_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.excluded_namespaces.insert(namespace.into());
        self
    }

    pub fn exclude_type(mut self, full_name: impl Into<String>) -> Self {
        self.config.excluded_types.insert(full_name.into());
        self
    }

    pub fn exclude_method(mut self, full_name: impl Into<String>) -> Self {
        self.config.excluded_methods.insert(full_name.into());
        self
    }

    pub fn preserve_public_api(mut self, preserve: bool) -> Self {
        self.config.preserve_public_api = preserve;
        self
    }

    pub fn debug_mode(mut self, mode: DebugMode) -> Self {
        self.config.debug_mode = mode;
        self
    }

    pub fn optimization(mut self, level: OptimizationLevel) -> Self {
        self.config.optimization = level;
        self
    }

    pub fn mapping_file(mut self, generate: bool) -> Self {
        self.config.renaming.generate_mapping_file = generate;
        self
    }

    pub fn build(self) -> ProtectionConfig {
        self.config
    }
}

/// Root YAML config structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct YamlConfig {
    /// Version of the config file format.
    pub version: String,
    /// The protection run configuration.
    pub protection: ProtectionConfig,
}

fn default_true() -> bool {
    true
}

fn default_complexity_threshold() -> u32 {
    3
}

fn default_preserved_prefixes() -> Vec<String> {
    vec!["System.".to_owned(), "Microsoft.".to_owned()]
}

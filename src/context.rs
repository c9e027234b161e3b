//! Obfuscation context and pass registry.
//!
//! The host pass manager feeds one module at a time to an [`Obfuscator`]
//! and names the pass to run. The obfuscator owns the configuration, the
//! report, and the random generator, so repeated invocations over one or
//! more modules accumulate into a single report.

use log::info;

use crate::fake_code::do_fake_code_insertion;
use crate::flatten::do_control_flow_flattening;
use crate::ir::Module;
use crate::report::Report;
use crate::result::{ChakravyuhaError, ChakravyuhaResult};
use crate::rng::Xorshift32;
use crate::safety::SafetyOracle;
use crate::string_encrypt::do_string_encryption;
use crate::write;

/// Pass name for string encryption.
pub const STRING_ENCRYPT_PASS: &str = "chakravyuha-string-encrypt";
/// Pass name for control-flow flattening.
pub const CONTROL_FLOW_FLATTEN_PASS: &str = "chakravyuha-control-flow-flatten";
/// Pass name for fake code insertion.
pub const FAKE_CODE_INSERTION_PASS: &str = "chakravyuha-fake-code-insertion";
/// Pass name for the report serializer.
pub const EMIT_REPORT_PASS: &str = "chakravyuha-emit-report";
/// Pass name running encryption, flattening, fake code and the report in
/// that order.
pub const ALL_PASSES: &str = "chakravyuha-all";

/// What a pass run left intact for the host's analysis caches.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PreservedAnalyses {
    /// The module was not modified.
    All,
    /// The module was modified; analyses must be recomputed.
    None,
}

/// Pipeline configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Input file name recorded in the report. Falls back to the module's
    /// source name when empty.
    pub input_file: String,
    /// Output file name recorded in the report. Falls back to the input
    /// name with `.obf` appended when empty.
    pub output_file: String,
    /// Run the string encryption pass.
    pub enable_string_encryption: bool,
    /// Run the control-flow flattening pass.
    pub enable_control_flow_flattening: bool,
    /// Run the fake code insertion pass.
    pub enable_fake_code_insertion: bool,
    /// Report platform override; defaults from the module's target triple.
    pub platform_override: Option<&'static str>,
    /// Fixed RNG seed. Leave `None` outside of tests.
    pub seed: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_file: String::new(),
            output_file: String::new(),
            enable_string_encryption: true,
            enable_control_flow_flattening: true,
            enable_fake_code_insertion: true,
            platform_override: None,
            seed: None,
        }
    }
}

impl Config {
    /// The obfuscation level recorded in the report. Only the medium
    /// profile is implemented.
    pub fn level_name(&self) -> &'static str {
        "medium"
    }
}

/// Persistent state for running the pass pipeline over modules.
pub struct Obfuscator {
    /// Pipeline configuration.
    pub config: Config,
    /// Accumulated counters and metadata.
    pub report: Report,
    rng: Xorshift32,
    captured_input_metrics: bool,
}

impl Obfuscator {
    /// Create an obfuscator from a configuration.
    pub fn new(config: Config) -> Self {
        let rng = match config.seed {
            Some(seed) => Xorshift32::from_seed(seed),
            None => Xorshift32::from_entropy(),
        };
        Self {
            config,
            report: Report::default(),
            rng,
            captured_input_metrics: false,
        }
    }

    /// Run the pass with the given literal name over `module`.
    pub fn run_pass(
        &mut self,
        module: &mut Module,
        name: &str,
    ) -> ChakravyuhaResult<PreservedAnalyses> {
        if name == ALL_PASSES {
            let mut preserved = PreservedAnalyses::All;
            for pass in [
                STRING_ENCRYPT_PASS,
                CONTROL_FLOW_FLATTEN_PASS,
                FAKE_CODE_INSERTION_PASS,
                EMIT_REPORT_PASS,
            ] {
                if self.run_one(module, pass)? == PreservedAnalyses::None {
                    preserved = PreservedAnalyses::None;
                }
            }
            return Ok(preserved);
        }
        self.run_one(module, name)
    }

    fn run_one(
        &mut self,
        module: &mut Module,
        name: &str,
    ) -> ChakravyuhaResult<PreservedAnalyses> {
        self.capture_input_metrics(module)?;
        match name {
            STRING_ENCRYPT_PASS => {
                if !self.config.enable_string_encryption {
                    return Ok(PreservedAnalyses::All);
                }
                let before = self.report.strings_encrypted;
                let oracle = SafetyOracle::compute(module);
                do_string_encryption(module, &oracle, &mut self.rng, &mut self.report);
                self.report.note_pass(name);
                let changed = self.report.strings_encrypted > before;
                info!(
                    "{name}: {} strings encrypted",
                    self.report.strings_encrypted - before
                );
                if changed {
                    eprintln!("{}", self.report.se_metrics_line());
                }
                Ok(preserved(changed))
            }
            CONTROL_FLOW_FLATTEN_PASS => {
                if !self.config.enable_control_flow_flattening {
                    return Ok(PreservedAnalyses::All);
                }
                let before = self.report.flattened_functions;
                let oracle = SafetyOracle::compute(module);
                do_control_flow_flattening(module, &oracle, &mut self.rng, &mut self.report);
                self.report.note_pass(name);
                let changed = self.report.flattened_functions > before;
                info!(
                    "{name}: {} functions flattened",
                    self.report.flattened_functions - before
                );
                if changed {
                    eprintln!("{}", self.report.cff_metrics_line());
                }
                Ok(preserved(changed))
            }
            FAKE_CODE_INSERTION_PASS => {
                if !self.config.enable_fake_code_insertion {
                    return Ok(PreservedAnalyses::All);
                }
                let before = self.report.inserted_blocks;
                let oracle = SafetyOracle::compute(module);
                do_fake_code_insertion(module, &oracle, &mut self.rng, &mut self.report);
                self.report.note_pass(name);
                let changed = self.report.inserted_blocks > before;
                info!(
                    "{name}: {} fake blocks inserted",
                    self.report.inserted_blocks - before
                );
                if changed {
                    eprintln!("{}", self.report.fci_metrics_line());
                }
                Ok(preserved(changed))
            }
            EMIT_REPORT_PASS => {
                self.report.obfuscated_ir_size = write::module_byte_size(module);
                self.report.obfuscated_string_data_size = write::string_data_size(module);
                eprintln!("{}", self.report.to_json(&self.config, &module.triple));
                Ok(PreservedAnalyses::All)
            }
            other => Err(ChakravyuhaError::UnknownPass(other.to_string())),
        }
    }

    /// First contact with a module: reject ill-formed input outright, then
    /// record the metrics the report compares against.
    fn capture_input_metrics(&mut self, module: &Module) -> ChakravyuhaResult<()> {
        if self.captured_input_metrics {
            return Ok(());
        }
        crate::verifier::verify_module(module)?;
        self.captured_input_metrics = true;
        self.report.original_ir_size = write::module_byte_size(module);
        self.report.original_string_data_size = write::string_data_size(module);
        self.report.input_file = if self.config.input_file.is_empty() {
            module.name.clone()
        } else {
            self.config.input_file.clone()
        };
        self.report.output_file = if self.config.output_file.is_empty() {
            format!("{}.obf", self.report.input_file)
        } else {
            self.config.output_file.clone()
        };
        Ok(())
    }
}

fn preserved(changed: bool) -> PreservedAnalyses {
    if changed {
        PreservedAnalyses::None
    } else {
        PreservedAnalyses::All
    }
}

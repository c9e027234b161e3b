//! The report aggregator.
//!
//! Every pass updates counters in a `Report` owned by the obfuscation
//! context; the report pass serializes a single JSON document to stderr
//! once the pipeline is done. The schema is stable: field order is fixed
//! by struct declaration order, percentages carry exactly two decimals and
//! the timestamp is ISO-8601 UTC.
//!
//! A process-wide `global()` handle exists as a compatibility layer for
//! hosts that cannot thread a context through their pass manager; the
//! passes themselves always take `&mut Report` explicitly.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::Serialize;

use crate::context::Config;

/// Counters and metadata accumulated across the pass pipeline.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Name of the input file, as reported by the host.
    pub input_file: String,
    /// Name of the output file, as reported by the host.
    pub output_file: String,
    /// Textual IR size before the first pass ran.
    pub original_ir_size: usize,
    /// Textual IR size at report time.
    pub obfuscated_ir_size: usize,
    /// Bytes of byte-array global data before the first pass ran.
    pub original_string_data_size: usize,
    /// Bytes of byte-array global data at report time.
    pub obfuscated_string_data_size: usize,
    /// Strings rewritten by the encryption pass.
    pub strings_encrypted: u32,
    /// Functions rebuilt by the flattener.
    pub flattened_functions: u32,
    /// Blocks now dispatched through a flattener state machine.
    pub flattened_blocks: u32,
    /// Functions the flattener considered and left alone.
    pub skipped_functions: u32,
    /// Junk blocks added by fake code insertion.
    pub inserted_blocks: u32,
    /// Names of the passes that ran, in order.
    pub passes_run: Vec<String>,
}

impl Report {
    /// Record that the named pass ran.
    pub fn note_pass(&mut self, name: &str) {
        self.passes_run.push(name.to_string());
    }

    /// The flattener's stderr metric line.
    pub fn cff_metrics_line(&self) -> String {
        #[derive(Serialize)]
        struct Line {
            #[serde(rename = "flattenedFunctions")]
            flattened_functions: u32,
            #[serde(rename = "flattenedBlocks")]
            flattened_blocks: u32,
            #[serde(rename = "skippedFunctions")]
            skipped_functions: u32,
        }
        let line = Line {
            flattened_functions: self.flattened_functions,
            flattened_blocks: self.flattened_blocks,
            skipped_functions: self.skipped_functions,
        };
        format!(
            "CFF_METRICS:{}",
            serde_json::to_string(&line).expect("metrics serialize")
        )
    }

    /// The string pass's stderr metric line.
    pub fn se_metrics_line(&self) -> String {
        #[derive(Serialize)]
        struct Line {
            #[serde(rename = "encryptedStrings")]
            encrypted_strings: u32,
        }
        format!(
            "SE_METRICS:{}",
            serde_json::to_string(&Line {
                encrypted_strings: self.strings_encrypted
            })
            .expect("metrics serialize")
        )
    }

    /// The fake-code pass's stderr metric line.
    pub fn fci_metrics_line(&self) -> String {
        #[derive(Serialize)]
        struct Line {
            #[serde(rename = "insertedBlocks")]
            inserted_blocks: u32,
        }
        format!(
            "FCI_METRICS:{}",
            serde_json::to_string(&Line {
                inserted_blocks: self.inserted_blocks
            })
            .expect("metrics serialize")
        )
    }

    /// Serialize the final report, timestamped now.
    pub fn to_json(&self, config: &Config, triple: &str) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.to_json_at(config, triple, now)
    }

    /// Serialize the final report with an explicit timestamp, for tests.
    pub(crate) fn to_json_at(&self, config: &Config, triple: &str, epoch_secs: u64) -> String {
        let doc = ReportDoc {
            input_file: &self.input_file,
            output_file: &self.output_file,
            timestamp: format_timestamp(epoch_secs),
            input_parameters: InputParameters {
                obfuscation_level: config.level_name(),
                target_platform: config
                    .platform_override
                    .unwrap_or_else(|| target_platform(triple)),
                enable_string_encryption: config.enable_string_encryption,
                enable_control_flow_flattening: config.enable_control_flow_flattening,
                enable_fake_code_insertion: config.enable_fake_code_insertion,
            },
            output_attributes: OutputAttributes {
                original_ir_size: format!("{} bytes", self.original_ir_size),
                obfuscated_ir_size: format!("{} bytes", self.obfuscated_ir_size),
                total_ir_size_change: percent_change(self.original_ir_size, self.obfuscated_ir_size),
                original_string_data_size: format!("{} bytes", self.original_string_data_size),
                obfuscated_string_data_size: format!("{} bytes", self.obfuscated_string_data_size),
                string_data_size_change: percent_change(
                    self.original_string_data_size,
                    self.obfuscated_string_data_size,
                ),
            },
            obfuscation_metrics: ObfuscationMetrics {
                cycles_completed: 1,
                passes_run: &self.passes_run,
                string_encryption: StringEncryptionMetrics {
                    count: self.strings_encrypted,
                    method: "polymorphic",
                },
                control_flow_flattening: FlatteningMetrics {
                    flattened_functions: self.flattened_functions,
                    flattened_blocks: self.flattened_blocks,
                    skipped_functions: self.skipped_functions,
                },
                fake_code_insertion: FakeCodeMetrics {
                    inserted_blocks: self.inserted_blocks,
                },
            },
        };
        serde_json::to_string_pretty(&doc).expect("report serialize")
    }
}

/// The process-wide report handle. Prefer threading a `Report` through an
/// `Obfuscator`; this exists for hosts that cannot.
pub fn global() -> &'static Mutex<Report> {
    static GLOBAL: OnceLock<Mutex<Report>> = OnceLock::new();
    GLOBAL.get_or_init(|| Mutex::new(Report::default()))
}

/// Derive the report's `targetPlatform` from a target triple.
pub fn target_platform(triple: &str) -> &'static str {
    use target_lexicon::{OperatingSystem, Triple};
    match triple.parse::<Triple>() {
        Ok(triple) if triple.operating_system == OperatingSystem::Windows => "windows",
        _ => "linux",
    }
}

fn percent_change(old: usize, new: usize) -> String {
    if old == 0 {
        return "0.00%".to_string();
    }
    let pct = (new as f64 - old as f64) / old as f64 * 100.0;
    format!("{pct:.2}%")
}

/// Render `YYYY-MM-DDTHH:MM:SSZ` for seconds since the Unix epoch, using
/// the days-to-civil conversion from Howard Hinnant's calendar algorithms.
fn format_timestamp(epoch_secs: u64) -> String {
    let days = (epoch_secs / 86_400) as i64;
    let secs_of_day = epoch_secs % 86_400;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        secs_of_day / 3_600,
        secs_of_day % 3_600 / 60,
        secs_of_day % 60
    )
}

#[derive(Serialize)]
struct ReportDoc<'a> {
    #[serde(rename = "inputFile")]
    input_file: &'a str,
    #[serde(rename = "outputFile")]
    output_file: &'a str,
    timestamp: String,
    #[serde(rename = "inputParameters")]
    input_parameters: InputParameters,
    #[serde(rename = "outputAttributes")]
    output_attributes: OutputAttributes,
    #[serde(rename = "obfuscationMetrics")]
    obfuscation_metrics: ObfuscationMetrics<'a>,
}

#[derive(Serialize)]
struct InputParameters {
    #[serde(rename = "obfuscationLevel")]
    obfuscation_level: &'static str,
    #[serde(rename = "targetPlatform")]
    target_platform: &'static str,
    #[serde(rename = "enableStringEncryption")]
    enable_string_encryption: bool,
    #[serde(rename = "enableControlFlowFlattening")]
    enable_control_flow_flattening: bool,
    #[serde(rename = "enableFakeCodeInsertion")]
    enable_fake_code_insertion: bool,
}

#[derive(Serialize)]
struct OutputAttributes {
    #[serde(rename = "originalIRSize")]
    original_ir_size: String,
    #[serde(rename = "obfuscatedIRSize")]
    obfuscated_ir_size: String,
    #[serde(rename = "totalIRSizeChange")]
    total_ir_size_change: String,
    #[serde(rename = "originalIRStringDataSize")]
    original_string_data_size: String,
    #[serde(rename = "obfuscatedIRStringDataSize")]
    obfuscated_string_data_size: String,
    #[serde(rename = "stringDataSizeChange")]
    string_data_size_change: String,
}

#[derive(Serialize)]
struct ObfuscationMetrics<'a> {
    #[serde(rename = "cyclesCompleted")]
    cycles_completed: u32,
    #[serde(rename = "passesRun")]
    passes_run: &'a [String],
    #[serde(rename = "stringEncryption")]
    string_encryption: StringEncryptionMetrics,
    #[serde(rename = "controlFlowFlattening")]
    control_flow_flattening: FlatteningMetrics,
    #[serde(rename = "fakeCodeInsertion")]
    fake_code_insertion: FakeCodeMetrics,
}

#[derive(Serialize)]
struct StringEncryptionMetrics {
    count: u32,
    method: &'static str,
}

#[derive(Serialize)]
struct FlatteningMetrics {
    #[serde(rename = "flattenedFunctions")]
    flattened_functions: u32,
    #[serde(rename = "flattenedBlocks")]
    flattened_blocks: u32,
    #[serde(rename = "skippedFunctions")]
    skipped_functions: u32,
}

#[derive(Serialize)]
struct FakeCodeMetrics {
    #[serde(rename = "insertedBlocks")]
    inserted_blocks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_iso8601_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_timestamp(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_timestamp(1_722_470_400), "2024-08-01T00:00:00Z");
        assert_eq!(format_timestamp(1_722_513_661), "2024-08-01T12:01:01Z");
    }

    #[test]
    fn percentages_have_two_decimals() {
        assert_eq!(percent_change(0, 100), "0.00%");
        assert_eq!(percent_change(100, 100), "0.00%");
        assert_eq!(percent_change(100, 250), "150.00%");
        assert_eq!(percent_change(200, 150), "-25.00%");
        assert_eq!(percent_change(300, 400), "33.33%");
    }

    #[test]
    fn platform_defaults_from_triple() {
        assert_eq!(target_platform("x86_64-pc-windows-msvc"), "windows");
        assert_eq!(target_platform("x86_64-unknown-linux-gnu"), "linux");
        assert_eq!(target_platform("not a triple"), "linux");
    }

    #[test]
    fn report_schema_is_stable() {
        let mut report = Report {
            input_file: "dir\\input \"a\".c".to_string(),
            output_file: "out.bc".to_string(),
            original_ir_size: 100,
            obfuscated_ir_size: 250,
            original_string_data_size: 17,
            obfuscated_string_data_size: 33,
            strings_encrypted: 1,
            flattened_functions: 2,
            flattened_blocks: 5,
            skipped_functions: 1,
            inserted_blocks: 4,
            ..Report::default()
        };
        report.note_pass("chakravyuha-string-encrypt");
        report.note_pass("chakravyuha-control-flow-flatten");

        let json = report.to_json_at(&Config::default(), "x86_64-unknown-linux-gnu", 0);
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["inputFile"], "dir\\input \"a\".c");
        assert_eq!(parsed["timestamp"], "1970-01-01T00:00:00Z");
        assert_eq!(parsed["inputParameters"]["obfuscationLevel"], "medium");
        assert_eq!(parsed["inputParameters"]["targetPlatform"], "linux");
        assert_eq!(parsed["outputAttributes"]["originalIRSize"], "100 bytes");
        assert_eq!(parsed["outputAttributes"]["totalIRSizeChange"], "150.00%");
        assert_eq!(
            parsed["outputAttributes"]["stringDataSizeChange"],
            "94.12%"
        );
        assert_eq!(parsed["obfuscationMetrics"]["cyclesCompleted"], 1);
        assert_eq!(
            parsed["obfuscationMetrics"]["stringEncryption"]["count"],
            1
        );
        assert_eq!(
            parsed["obfuscationMetrics"]["controlFlowFlattening"]["flattenedBlocks"],
            5
        );
        assert_eq!(
            parsed["obfuscationMetrics"]["fakeCodeInsertion"]["insertedBlocks"],
            4
        );
        // Escaping: the raw text must carry escaped quote and backslash.
        assert!(json.contains("dir\\\\input \\\"a\\\".c"));

        // Field order is declaration order in the emitted text.
        let positions: Vec<usize> = [
            "\"inputFile\"",
            "\"outputFile\"",
            "\"timestamp\"",
            "\"inputParameters\"",
            "\"outputAttributes\"",
            "\"obfuscationMetrics\"",
        ]
        .iter()
        .map(|key| json.find(key).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn metric_lines_are_prefixed_json() {
        let report = Report {
            flattened_functions: 3,
            flattened_blocks: 12,
            skipped_functions: 2,
            strings_encrypted: 4,
            inserted_blocks: 9,
            ..Report::default()
        };
        assert_eq!(
            report.cff_metrics_line(),
            "CFF_METRICS:{\"flattenedFunctions\":3,\"flattenedBlocks\":12,\"skippedFunctions\":2}"
        );
        assert_eq!(report.se_metrics_line(), "SE_METRICS:{\"encryptedStrings\":4}");
        assert_eq!(report.fci_metrics_line(), "FCI_METRICS:{\"insertedBlocks\":9}");
    }
}

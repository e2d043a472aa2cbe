mod audit;
mod classfile;
mod codec;
mod config;
mod descriptor;
mod engine;
mod error;
mod ir;
mod matcher;
mod opcodes;
mod passes;
mod report;
mod rewrite;
mod scan;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tracing::{debug, info, warn, Level};

use crate::audit::{AuditSink, FileAuditSink, MemoryAuditSink};
use crate::config::Config;
use crate::engine::PassChain;
use crate::error::DynamicConstant;
use crate::passes::build_chain;
use crate::report::{build_invocation, build_sarif, UnitOutcome};
use crate::scan::{scan_inputs, Unit, UnitKind};

/// CLI arguments for classhook execution.
#[derive(Parser, Debug)]
#[command(
    name = "classhook",
    about = "Build-time instrumentation of JVM class files: click debouncing, privacy access auditing and thread naming.",
    version
)]
struct Cli {
    /// Class file, jar, IR document or directory to instrument.
    #[arg(long, value_name = "PATH", required = true)]
    input: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    config: PathBuf,
    #[arg(long, value_name = "DIR")]
    output: PathBuf,
    /// Directory of the privacy audit report. Defaults to `<output>/audit`.
    #[arg(long, value_name = "DIR")]
    audit_dir: Option<PathBuf>,
    /// SARIF report of applied hooks, `-` for stdout.
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long, conflicts_with = "verbose")]
    quiet: bool,
    #[arg(long)]
    verbose: bool,
    #[arg(long)]
    timing: bool,
    /// Run every pass and report, but write neither outputs nor audit records.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);
    run(cli)
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        Level::WARN
    } else if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    for input in &cli.input {
        if !input.exists() {
            anyhow::bail!("input not found: {}", input.display());
        }
    }

    let started_at = Instant::now();
    let config = Config::load(&cli.config)?;
    let audit_dir = cli
        .audit_dir
        .clone()
        .unwrap_or_else(|| cli.output.join("audit"));
    let file_sink = FileAuditSink::new(&audit_dir, Local::now());
    let audit_path = file_sink.path().to_path_buf();
    let memory_sink = Arc::new(MemoryAuditSink::default());
    let sink: Arc<dyn AuditSink> = if cli.dry_run {
        memory_sink.clone()
    } else {
        Arc::new(file_sink)
    };
    let chain = build_chain(&config, sink);
    info!(passes = ?chain.pass_names(), "instrumentation chain ready");

    let units = scan_inputs(&cli.input)?;
    let output = (!cli.dry_run).then_some(cli.output.as_path());
    let mut outcomes = Vec::with_capacity(units.len());
    for unit in &units {
        outcomes.push(process_unit(&chain, unit, output)?);
    }
    let changed = outcomes.iter().filter(|outcome| outcome.changed()).count();
    if cli.dry_run {
        for (unit, lines) in memory_sink.records() {
            info!(unit = %unit, accesses = lines.len(), "privacy audit (dry run)");
        }
    } else if audit_path.exists() {
        info!(path = %audit_path.display(), "privacy audit written");
    }

    if let Some(report) = cli.report.as_deref() {
        let sarif = build_sarif(&chain.pass_names(), &outcomes, build_invocation())?;
        let mut writer = output_writer(report)?;
        serde_json::to_writer_pretty(&mut writer, &sarif)
            .context("failed to serialize SARIF output")?;
        writer
            .write_all(b"\n")
            .context("failed to write SARIF output")?;
    }

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} units={} changed={}",
            started_at.elapsed().as_millis(),
            units.len(),
            changed
        );
    }

    Ok(())
}

/// Run one unit through the chain and write the result below `output`, if given.
///
/// Unchanged units keep their original bytes and name; changed units are handed on as IR
/// documents.
fn process_unit(chain: &PassChain, unit: &Unit, output: Option<&Path>) -> Result<UnitOutcome> {
    let decoded = match unit.kind {
        UnitKind::ClassFile => classfile::decode_class(&unit.bytes),
        UnitKind::Document => codec::read_class(&unit.bytes),
    };
    let class = match decoded {
        Ok(class) => class,
        Err(error) if error.downcast_ref::<DynamicConstant>().is_some() => {
            warn!(unit = %unit.origin, reason = %error, "passing unit through uninstrumented");
            if let Some(output) = output {
                write_output(output, &unit.name, &unit.bytes)?;
            }
            return Ok(UnitOutcome {
                origin: unit.origin.clone(),
                length: unit.bytes.len() as u64,
                hooks: Vec::new(),
            });
        }
        Err(error) => {
            return Err(error.context(format!("failed to decode {}", unit.origin)));
        }
    };

    let transformed = chain
        .transform(class)
        .with_context(|| format!("failed to instrument {}", unit.origin))?;
    if !transformed.changed() {
        debug!(unit = %unit.origin, "unit unchanged");
    }
    if let Some(output) = output {
        if transformed.changed() {
            let bytes = codec::write_class(&transformed.class)?;
            write_output(output, &codec::document_name(&transformed.class), &bytes)?;
        } else {
            write_output(output, &unit.name, &unit.bytes)?;
        }
    }

    Ok(UnitOutcome {
        origin: unit.origin.clone(),
        length: unit.bytes.len() as u64,
        hooks: transformed.hooks,
    })
}

fn write_output(output: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let relative = Path::new(name);
    if !relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)))
    {
        anyhow::bail!("refusing to write {name} outside {}", output.display());
    }
    let path = output.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn output_writer(path: &Path) -> Result<Box<dyn Write>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdout()));
    }
    Ok(Box::new(
        File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Class, Constant, FieldOp, Instruction, MemberRef, Method, ACC_PUBLIC};

    const CONFIG: &str = r#"{
        "privacy_sentry": {
            "sensitive": [
                {"kind": "field", "owner": "android/os/Build", "name": "BRAND", "descriptor": "Ljava/lang/String;"}
            ],
            "record_sink": {"owner": "com/example/Audit", "name": "record", "descriptor": "(Ljava/lang/String;)V"}
        }
    }"#;

    fn document(name: &str, instructions: Vec<Instruction>) -> Vec<u8> {
        let mut method = Method::new("identify", "()Ljava/lang/String;", ACC_PUBLIC);
        method.instructions = instructions;
        let class = Class {
            name: name.to_string(),
            super_name: Some("java/lang/Object".to_string()),
            interfaces: Vec::new(),
            access_flags: ACC_PUBLIC,
            annotations: Vec::new(),
            methods: vec![method],
        };
        codec::write_class(&class).expect("write document")
    }

    fn unit(name: &str, bytes: Vec<u8>) -> Unit {
        Unit {
            name: name.to_string(),
            origin: format!("in/{name}"),
            kind: UnitKind::Document,
            bytes,
        }
    }

    #[test]
    fn unchanged_unit_is_copied_byte_for_byte() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = Config::parse(CONFIG).expect("config");
        let chain = build_chain(&config, Arc::new(MemoryAuditSink::default()));
        let bytes = document(
            "com/example/Quiet",
            vec![Instruction::Constant(Constant::Null), Instruction::Return(None)],
        );

        let outcome = process_unit(&chain, &unit("Quiet.json", bytes.clone()), Some(temp_dir.path()))
            .expect("process");

        assert!(!outcome.changed());
        assert_eq!(bytes, fs::read(temp_dir.path().join("Quiet.json")).expect("read output"));
    }

    #[test]
    fn changed_unit_is_written_as_document_and_audited() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let config = Config::parse(CONFIG).expect("config");
        let sink = Arc::new(MemoryAuditSink::default());
        let chain = build_chain(&config, sink.clone());
        let outcome = process_unit(&chain, &unit("C.json", brand_reader()), Some(temp_dir.path()))
            .expect("process");

        assert_eq!(1, outcome.hooks.len());
        let written = fs::read(temp_dir.path().join("com/example/C.json")).expect("read output");
        let class = codec::read_class(&written).expect("read document");
        assert!(class.methods[0].modified);
        assert_eq!(1, sink.records().len());
    }

    fn brand_reader() -> Vec<u8> {
        document(
            "com/example/C",
            vec![
                Instruction::Field {
                    op: FieldOp::GetStatic,
                    field: MemberRef::new("android/os/Build", "BRAND", "Ljava/lang/String;"),
                },
                Instruction::Return(None),
            ],
        )
    }

    fn cli_in(dir: &Path, extra: &[&str]) -> Cli {
        let input = dir.join("in");
        fs::create_dir_all(&input).expect("create input dir");
        fs::write(input.join("C.json"), brand_reader()).expect("write input");
        fs::write(dir.join("config.json"), CONFIG).expect("write config");

        let mut arguments = vec![
            "classhook".to_string(),
            "--input".to_string(),
            input.display().to_string(),
            "--config".to_string(),
            dir.join("config.json").display().to_string(),
            "--output".to_string(),
            dir.join("out").display().to_string(),
        ];
        arguments.extend(extra.iter().map(|argument| argument.to_string()));
        Cli::try_parse_from(arguments).expect("parse arguments")
    }

    #[test]
    fn run_writes_changed_units_and_audit() {
        let temp_dir = tempfile::tempdir().expect("temp dir");

        run(cli_in(temp_dir.path(), &[])).expect("run");

        let out = temp_dir.path().join("out");
        assert!(out.join("com/example/C.json").exists());
        assert_eq!(1, fs::read_dir(out.join("audit")).expect("list audit").count());
    }

    #[test]
    fn dry_run_writes_nothing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let report = temp_dir.path().join("report.sarif");

        run(cli_in(
            temp_dir.path(),
            &["--dry-run", "--report", &report.display().to_string()],
        ))
        .expect("run");

        assert!(!temp_dir.path().join("out").exists());
        let sarif: serde_json::Value =
            serde_json::from_slice(&fs::read(&report).expect("read report")).expect("parse report");
        assert_eq!(1, sarif["runs"][0]["results"].as_array().expect("results").len());
    }

    #[test]
    fn document_named_outside_output_is_refused() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let output = temp_dir.path().join("out");

        let error = write_output(&output, "../Evil.json", b"{}").expect_err("escape");

        assert!(error.to_string().contains("refusing to write ../Evil.json"));
        assert!(!temp_dir.path().join("Evil.json").exists());
    }

    #[test]
    fn class_with_dynamic_constant_passes_through() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let chain = build_chain(&Config::default(), Arc::new(MemoryAuditSink::default()));
        let bytes = condy_class();
        let unit = Unit {
            name: "com/example/Condy.class".to_string(),
            origin: "in/com/example/Condy.class".to_string(),
            kind: UnitKind::ClassFile,
            bytes: bytes.clone(),
        };

        let outcome = process_unit(&chain, &unit, Some(temp_dir.path())).expect("process");

        assert!(!outcome.changed());
        assert_eq!(
            bytes,
            fs::read(temp_dir.path().join("com/example/Condy.class")).expect("read output")
        );
    }

    /// `class com/example/Condy { static void run() { ldc <condy #7>; pop; return; } }`
    fn condy_class() -> Vec<u8> {
        fn utf8(bytes: &mut Vec<u8>, value: &str) {
            bytes.push(1);
            bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
            bytes.extend_from_slice(value.as_bytes());
        }

        let mut bytes = vec![0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x37];
        bytes.extend_from_slice(&12u16.to_be_bytes());
        utf8(&mut bytes, "com/example/Condy"); // #1
        bytes.extend_from_slice(&[7, 0x00, 0x01]); // #2 Class
        utf8(&mut bytes, "java/lang/Object"); // #3
        bytes.extend_from_slice(&[7, 0x00, 0x03]); // #4 Class
        utf8(&mut bytes, "value"); // #5
        utf8(&mut bytes, "I"); // #6
        bytes.extend_from_slice(&[17, 0x00, 0x00, 0x00, 0x08]); // #7 Dynamic
        bytes.extend_from_slice(&[12, 0x00, 0x05, 0x00, 0x06]); // #8 NameAndType
        utf8(&mut bytes, "run"); // #9
        utf8(&mut bytes, "()V"); // #10
        utf8(&mut bytes, "Code"); // #11
        bytes.extend_from_slice(&[0x00, 0x21, 0x00, 0x02, 0x00, 0x04]);
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // interfaces, fields
        bytes.extend_from_slice(&[0x00, 0x01]); // methods
        bytes.extend_from_slice(&[0x00, 0x09, 0x00, 0x09, 0x00, 0x0a, 0x00, 0x01]);
        let code = [opcodes::LDC, 0x07, opcodes::POP, opcodes::RETURN];
        bytes.extend_from_slice(&[0x00, 0x0b]);
        bytes.extend_from_slice(&(12 + code.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]); // max stack, max locals
        bytes.extend_from_slice(&(code.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&code);
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // exception table, attributes
        bytes.extend_from_slice(&[0x00, 0x00]); // class attributes
        bytes
    }

    #[test]
    fn broken_unit_names_its_origin() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let chain = build_chain(&Config::default(), Arc::new(MemoryAuditSink::default()));

        let error = process_unit(&chain, &unit("Bad.json", b"nope".to_vec()), Some(temp_dir.path()))
            .expect_err("broken unit");

        assert!(error.to_string().contains("failed to decode in/Bad.json"));
    }
}

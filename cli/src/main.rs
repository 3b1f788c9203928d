use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use comfy_table::{presets::ASCII_FULL, Table};
use nexpose_core::{decode, EvidenceNode, ScanRun};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_MAX_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(author, version, about = "Decode Nexpose XML scan reports")]
struct NexposeCli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a report and print the full tree
    Decode {
        /// Path to the XML report, or `-` for stdin
        input: PathBuf,
        /// Output format
        #[arg(long, default_value_t = TreeFormat::Json)]
        format: TreeFormat,
        /// Single-line JSON instead of pretty-printed
        #[arg(long)]
        compact: bool,
        /// Refuse inputs larger than this many bytes
        #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
        max_bytes: u64,
    },
    /// Decode a report and print host, endpoint and test tables
    Summary {
        /// Path to the XML report, or `-` for stdin
        input: PathBuf,
        /// Refuse inputs larger than this many bytes
        #[arg(long, default_value_t = DEFAULT_MAX_BYTES)]
        max_bytes: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TreeFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for TreeFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            TreeFormat::Json => "json",
            TreeFormat::Yaml => "yaml",
        };
        write!(f, "{value}")
    }
}

fn main() -> anyhow::Result<()> {
    let cli = NexposeCli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Decode {
            input,
            format,
            compact,
            max_bytes,
        } => {
            let run = load_report(&input, max_bytes)?;
            output_tree(&run, format, compact)?;
        }
        Command::Summary { input, max_bytes } => {
            let run = load_report(&input, max_bytes)?;
            output_summary(&run);
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();
}

fn load_report(input: &Path, max_bytes: u64) -> anyhow::Result<ScanRun> {
    let bytes = if input == Path::new("-") {
        read_limited(io::stdin().lock(), max_bytes).context("failed to read report from stdin")?
    } else {
        let file = File::open(input)
            .with_context(|| format!("failed to open report {}", input.display()))?;
        read_limited(file, max_bytes)
            .with_context(|| format!("failed to read report {}", input.display()))?
    };
    info!(bytes = bytes.len(), input = %input.display(), "loaded report");

    let run = decode(&bytes).with_context(|| format!("failed to decode {}", input.display()))?;
    debug!(tests = run.all_tests().count(), "report decoded");
    Ok(run)
}

fn read_limited<R: Read>(reader: R, max_bytes: u64) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    reader
        .take(max_bytes.saturating_add(1))
        .read_to_end(&mut bytes)?;
    if bytes.len() as u64 > max_bytes {
        bail!("input exceeds the {max_bytes} byte limit");
    }
    Ok(bytes)
}

fn output_tree(run: &ScanRun, format: TreeFormat, compact: bool) -> anyhow::Result<()> {
    match format {
        TreeFormat::Json if compact => println!("{}", serde_json::to_string(run)?),
        TreeFormat::Json => println!("{}", serde_json::to_string_pretty(run)?),
        TreeFormat::Yaml => print!("{}", serde_yaml::to_string(run)?),
    }
    Ok(())
}

fn output_summary(run: &ScanRun) {
    println!("Host {} ({})", display_or_dash(&run.address), display_or_dash(&run.status));
    if !run.host_names.is_empty() {
        let names: Vec<&str> = run.host_names.iter().map(|h| h.name.as_str()).collect();
        println!("Names: {}", names.join(", "));
    }
    for fingerprint in &run.fingerprints {
        println!(
            "OS: {} {} {} (certainty {})",
            fingerprint.vendor,
            fingerprint.product,
            fingerprint.version,
            display_or_dash(&fingerprint.certainty)
        );
    }

    if !run.endpoints.is_empty() {
        println!("\nEndpoints:");
        println!("{}", endpoint_table(run));
    }
    if run.all_tests().next().is_some() {
        println!("\nTests:");
        println!("{}", test_table(run));
    }
}

fn endpoint_table(run: &ScanRun) -> Table {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["Port", "Protocol", "Status", "Service", "Product", "Configs"]);

    for endpoint in &run.endpoints {
        if endpoint.services.is_empty() {
            table.add_row(vec![
                endpoint.port.clone(),
                endpoint.protocol.clone(),
                endpoint.status.clone(),
                String::new(),
                String::new(),
                String::new(),
            ]);
        }
        for service in &endpoint.services {
            let product = service
                .fingerprints
                .first()
                .map(|fp| format!("{} {}", fp.product, fp.version).trim().to_string())
                .unwrap_or_default();
            table.add_row(vec![
                endpoint.port.clone(),
                endpoint.protocol.clone(),
                endpoint.status.clone(),
                service.name.clone(),
                product,
                service.configurations.len().to_string(),
            ]);
        }
    }

    table
}

fn test_table(run: &ScanRun) -> Table {
    let mut table = Table::new();
    table.load_preset(ASCII_FULL);
    table.set_header(vec!["Test", "Scope", "Status", "PCI", "Since", "Evidence"]);

    let host_tests = run.tests.iter().map(|test| ("host".to_string(), test));
    let service_tests = run.endpoints.iter().flat_map(|endpoint| {
        endpoint.services.iter().flat_map(move |service| {
            let scope = format!("{}/{} {}", endpoint.port, endpoint.protocol, service.name);
            service.tests.iter().map(move |test| (scope.clone(), test))
        })
    });

    for (scope, test) in host_tests.chain(service_tests) {
        table.add_row(vec![
            test.id.clone(),
            scope,
            test.status.clone(),
            test.pci_compliance_status.clone(),
            test.vulnerable_since.clone(),
            first_evidence_line(&test.paragraphs),
        ]);
    }

    table
}

fn first_evidence_line(paragraphs: &[EvidenceNode]) -> String {
    for paragraph in paragraphs {
        let line = paragraph.text.trim();
        if !line.is_empty() {
            return line.lines().next().unwrap_or_default().to_string();
        }
        let nested = first_evidence_line(&paragraph.paragraphs);
        if !nested.is_empty() {
            return nested;
        }
    }
    String::new()
}

fn display_or_dash(value: &str) -> &str {
    if value.is_empty() {
        "-"
    } else {
        value
    }
}

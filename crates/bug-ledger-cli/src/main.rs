use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use bug_ledger_api::{
    load_config, CrashInput, CreateBugRequest, LedgerApi, MarkDuplicateRequest,
};
use bug_ledger_core::{
    format_title, parse_title, text_link, BuildRecord, LedgerConfig, TextId, TextKind,
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "bl")]
#[command(about = "Bug ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./bug_ledger.sqlite3")]
    db: PathBuf,

    /// YAML file with namespace keys, resolver and text limits.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Title {
        #[command(subcommand)]
        command: TitleCommand,
    },
    Bug {
        #[command(subcommand)]
        command: BugCommand,
    },
    Build {
        #[command(subcommand)]
        command: Box<BuildCommand>,
    },
    Text {
        #[command(subcommand)]
        command: TextCommand,
    },
    Crash {
        #[command(subcommand)]
        command: Box<CrashCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum TitleCommand {
    Format {
        #[arg(long)]
        title: String,
        #[arg(long, default_value_t = 0)]
        seq: u64,
    },
    Parse {
        #[arg(long)]
        display: String,
    },
}

#[derive(Debug, Args)]
struct BugRef {
    #[arg(long)]
    namespace: String,
    /// Display title, including any ` (N)` suffix.
    #[arg(long)]
    title: String,
}

#[derive(Debug, Subcommand)]
enum BugCommand {
    Create {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        first_time: Option<String>,
    },
    Show(BugRef),
    Canonical(BugRef),
    Dup {
        #[command(flatten)]
        bug: BugRef,
        /// Display title of the bug this one duplicates.
        #[arg(long)]
        dup_of: String,
    },
    ReportingKey {
        #[command(flatten)]
        bug: BugRef,
        /// Reporting the bug is sent through, e.g. `upstream`.
        #[arg(long)]
        reporting: String,
    },
}

#[derive(Debug, Subcommand)]
enum BuildCommand {
    Add(BuildAddArgs),
    Show {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Args)]
struct BuildAddArgs {
    #[arg(long)]
    namespace: String,
    #[arg(long)]
    id: String,
    #[arg(long)]
    manager: String,
    #[arg(long, default_value = "linux")]
    os: String,
    #[arg(long, default_value = "amd64")]
    arch: String,
    #[arg(long, default_value = "amd64")]
    vm_arch: String,
    #[arg(long, default_value = "")]
    syzkaller_commit: String,
    #[arg(long, default_value = "")]
    compiler_id: String,
    #[arg(long, default_value = "")]
    kernel_repo: String,
    #[arg(long, default_value = "")]
    kernel_branch: String,
    #[arg(long, default_value = "")]
    kernel_commit: String,
    #[arg(long)]
    kernel_config_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum TextCommand {
    Put {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        kind: TextKindArg,
        #[arg(long)]
        file: PathBuf,
    },
    Get {
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        id: u64,
        #[arg(long)]
        kind: Option<TextKindArg>,
        /// Write the content here instead of embedding it in the JSON output.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Link {
        #[arg(long)]
        kind: TextKindArg,
        #[arg(long)]
        id: u64,
    },
}

#[derive(Debug, Subcommand)]
enum CrashCommand {
    Add(CrashAddArgs),
    List(BugRef),
}

#[derive(Debug, Args)]
struct CrashAddArgs {
    #[command(flatten)]
    bug: BugRef,
    #[arg(long)]
    manager: String,
    #[arg(long)]
    build_id: String,
    #[arg(long)]
    time: Option<String>,
    #[arg(long = "maintainer")]
    maintainers: Vec<String>,
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    repro_opts: Option<PathBuf>,
    #[arg(long)]
    repro_syz: Option<PathBuf>,
    #[arg(long)]
    repro_c: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TextKindArg {
    CrashLog,
    CrashReport,
    ReproSyz,
    ReproC,
    KernelConfig,
}

impl TextKindArg {
    fn into_text_kind(self) -> TextKind {
        match self {
            Self::CrashLog => TextKind::CrashLog,
            Self::CrashReport => TextKind::CrashReport,
            Self::ReproSyz => TextKind::ReproSyz,
            Self::ReproC => TextKind::ReproC,
            Self::KernelConfig => TextKind::KernelConfig,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match cli.config.as_deref() {
        Some(path) => load_config(path)?,
        None => LedgerConfig::default(),
    };
    debug!(db = %cli.db.display(), "starting bug ledger command");
    let api = LedgerApi::new(cli.db, config);

    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Title { command } => run_title(command),
        Command::Bug { command } => run_bug(command, &api),
        Command::Build { command } => run_build(*command, &api),
        Command::Text { command } => run_text(command, &api),
        Command::Crash { command } => run_crash(*command, &api),
    }
}

fn run_db(command: DbCommand, api: &LedgerApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(value)
        }
        DbCommand::Backup(args) => {
            api.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "pending_versions": status.pending_versions
            }))
        }
    }
}

fn run_title(command: TitleCommand) -> Result<()> {
    match command {
        TitleCommand::Format { title, seq } => {
            let display = format_title(&title, seq);
            emit_json(serde_json::json!({
                "title": title,
                "seq": seq,
                "display_title": display
            }))
        }
        TitleCommand::Parse { display } => {
            let (title, seq) = parse_title(&display)?;
            emit_json(serde_json::json!({
                "display_title": display,
                "title": title,
                "seq": seq
            }))
        }
    }
}

fn run_bug(command: BugCommand, api: &LedgerApi) -> Result<()> {
    let value = match command {
        BugCommand::Create { namespace, title, first_time } => {
            let first_time = first_time.as_deref().map(parse_rfc3339).transpose()?;
            let created = api.create_bug(CreateBugRequest { namespace, title, first_time })?;
            serde_json::to_value(&created)
        }
        BugCommand::Show(bug) => serde_json::to_value(api.show_bug(&bug.namespace, &bug.title)?),
        BugCommand::Canonical(bug) => {
            serde_json::to_value(api.canonical_bug(&bug.namespace, &bug.title)?)
        }
        BugCommand::Dup { bug, dup_of } => serde_json::to_value(api.mark_duplicate(
            &MarkDuplicateRequest { namespace: bug.namespace, title: bug.title, dup_of },
        )?),
        BugCommand::ReportingKey { bug, reporting } => {
            serde_json::to_value(api.reporting_key(&bug.namespace, &bug.title, &reporting)?)
        }
    };
    emit_json(value.context("failed to serialize bug")?)
}

fn run_build(command: BuildCommand, api: &LedgerApi) -> Result<()> {
    match command {
        BuildCommand::Add(args) => {
            let kernel_config = match args.kernel_config_file.as_deref() {
                Some(path) => {
                    api.put_text(&args.namespace, TextKind::KernelConfig, &read_file(path)?)?.id
                }
                None => TextId::NONE,
            };
            let build = BuildRecord {
                namespace: args.namespace,
                manager: args.manager,
                id: args.id,
                os: args.os,
                arch: args.arch,
                vm_arch: args.vm_arch,
                syzkaller_commit: args.syzkaller_commit,
                compiler_id: args.compiler_id,
                kernel_repo: args.kernel_repo,
                kernel_branch: args.kernel_branch,
                kernel_commit: args.kernel_commit,
                kernel_config,
            };
            let key = api.add_build(&build)?;
            emit_json(serde_json::json!({
                "key": key,
                "kernel_config_link": build.kernel_config_link(),
                "build": build
            }))
        }
        BuildCommand::Show { namespace, id } => {
            let build = api.show_build(&namespace, &id)?;
            emit_json(serde_json::json!({
                "kernel_config_link": build.kernel_config_link(),
                "build": build
            }))
        }
    }
}

fn run_text(command: TextCommand, api: &LedgerApi) -> Result<()> {
    match command {
        TextCommand::Put { namespace, kind, file } => {
            let stored = api.put_text(&namespace, kind.into_text_kind(), &read_file(&file)?)?;
            emit_json(serde_json::json!({
                "namespace": namespace,
                "link": stored.link(),
                "text": stored
            }))
        }
        TextCommand::Get { namespace, id, kind, out } => {
            let content =
                api.get_text(&namespace, kind.map(TextKindArg::into_text_kind), TextId(id))?;
            let mut value = serde_json::json!({
                "namespace": namespace,
                "id": id,
                "bytes": content.len()
            });
            match out {
                Some(path) => {
                    fs::write(&path, &content).with_context(|| {
                        format!("failed to write text to {}", path.display())
                    })?;
                    value["out"] = serde_json::json!(path);
                }
                None => {
                    let text = String::from_utf8_lossy(&content).into_owned();
                    value["content"] = Value::String(text);
                }
            }
            emit_json(value)
        }
        TextCommand::Link { kind, id } => {
            let kind = kind.into_text_kind();
            emit_json(serde_json::json!({
                "kind": kind,
                "id": id,
                "link": text_link(kind, TextId(id))
            }))
        }
    }
}

fn run_crash(command: CrashCommand, api: &LedgerApi) -> Result<()> {
    match command {
        CrashCommand::Add(args) => {
            let input = CrashInput {
                manager: args.manager,
                build_id: args.build_id,
                time: match args.time.as_deref() {
                    Some(raw) => parse_rfc3339(raw)?,
                    None => OffsetDateTime::now_utc(),
                },
                maintainers: args.maintainers,
                log: read_optional_file(args.log.as_deref())?,
                report: read_optional_file(args.report.as_deref())?,
                repro_opts: read_optional_file(args.repro_opts.as_deref())?,
                repro_syz: read_optional_file(args.repro_syz.as_deref())?,
                repro_c: read_optional_file(args.repro_c.as_deref())?,
            };
            let crash = api.add_crash(&args.bug.namespace, &args.bug.title, &input)?;
            let links = crash
                .text_links()
                .into_iter()
                .map(|(kind, link)| (kind.as_str().to_string(), Value::String(link)))
                .collect::<serde_json::Map<_, _>>();
            emit_json(serde_json::json!({
                "crash": crash,
                "repro_level": crash.repro_level(),
                "links": links
            }))
        }
        CrashCommand::List(bug) => {
            let crashes = api.list_crashes(&bug.namespace, &bug.title)?;
            emit_json(serde_json::json!({
                "namespace": bug.namespace,
                "title": bug.title,
                "count": crashes.len(),
                "crashes": crashes
            }))
        }
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn read_optional_file(path: Option<&Path>) -> Result<Vec<u8>> {
    path.map_or_else(|| Ok(Vec::new()), read_file)
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}

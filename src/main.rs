use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use opencare::config::{self, RetentionPolicy, Settings};
use opencare::db::{self, DbRole};
use opencare::models::{AuditContext, NewUser, UserRole};
use opencare::{provisioning, seed};

#[derive(Debug, Parser)]
#[command(
    name = "opencare",
    version,
    about = "Provision and maintain an OpenCare database",
    long_about = "opencare prepares and maintains the OpenCare data store.\n\n\
        Commands, in first-run order:\n  \
        provision     Check privileges and store settings\n  \
        migrate       Apply schema migrations\n  \
        create-admin  Create the first administrator\n  \
        seed          Load the sample location tree, facility and patient\n  \
        verify-audit  Recompute the audit hash chain"
)]
struct Cli {
    /// Database file (overrides OPENCARE_DB_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the one-time provisioning routine
    Provision(ProvisionArgs),
    /// Apply pending schema migrations
    Migrate,
    /// Create the initial administrator (no-op if one exists)
    CreateAdmin(AdminArgs),
    /// Load idempotent sample data
    Seed,
    /// Verify the audit trail hash chain
    VerifyAudit,
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// Timezone name, e.g. Africa/Nairobi (overrides OPENCARE_TIMEZONE)
    #[arg(long)]
    timezone: Option<String>,

    /// Profile retention: anonymize or remove (overrides OPENCARE_RETENTION)
    #[arg(long)]
    retention: Option<String>,
}

#[derive(Debug, Args)]
struct AdminArgs {
    #[arg(long)]
    username: String,

    #[arg(long)]
    email: String,

    #[arg(long)]
    first_name: String,

    #[arg(long)]
    last_name: String,

    #[arg(long)]
    phone: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::from_env().context("reading OPENCARE_* settings")?;
    if let Some(path) = cli.database {
        settings.database_path = path;
    }
    tracing::debug!(version = config::APP_VERSION, path = %settings.database_path.display(), "starting");

    match cli.command {
        Command::Provision(args) => run_provision(settings, &args),
        Command::Migrate => run_migrate(&settings),
        Command::CreateAdmin(args) => run_create_admin(&settings, args),
        Command::Seed => run_seed(&settings),
        Command::VerifyAudit => run_verify_audit(&settings),
    }
}

fn run_provision(mut settings: Settings, args: &ProvisionArgs) -> Result<()> {
    if let Some(tz) = &args.timezone {
        settings.timezone = tz.clone();
    }
    if let Some(retention) = &args.retention {
        settings.retention = retention.parse::<RetentionPolicy>()?;
    }
    if let Some(parent) = settings.database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let conn = db::open_database_unmigrated(&settings.database_path)?;
    let report = provisioning::provision(&conn, &settings)?;
    for outcome in &report.steps {
        println!("✓ {:<18} {}", outcome.step.as_str(), outcome.detail);
    }
    println!("\nProvisioning complete. Next steps:");
    for (n, step) in provisioning::NEXT_STEPS.iter().enumerate() {
        println!("  {}. {step}", n + 1);
    }
    Ok(())
}

fn run_migrate(settings: &Settings) -> Result<()> {
    let conn = db::open_database_unmigrated(&settings.database_path)?;
    let before = db::get_current_version(&conn)?;
    db::run_migrations(&conn)?;
    let after = db::get_current_version(&conn)?;
    println!("Schema at version {after} (was {before})");
    Ok(())
}

fn run_create_admin(settings: &Settings, args: AdminArgs) -> Result<()> {
    let conn = db::open_role_connection(&settings.database_path, DbRole::Admin)?;
    let request = NewUser {
        username: args.username,
        email: args.email,
        first_name: args.first_name,
        last_name: args.last_name,
        role: UserRole::Admin,
        phone_number: args.phone,
    };
    match seed::create_initial_admin(&conn, &AuditContext::system(), &request)? {
        Some(admin) => println!("Created administrator {} ({})", admin.username, admin.id),
        None => println!("An active administrator already exists; nothing to do"),
    }
    Ok(())
}

fn run_seed(settings: &Settings) -> Result<()> {
    let conn = db::open_role_connection(&settings.database_path, DbRole::Admin)?;
    let data = seed::load_sample_data(&conn, &AuditContext::system())?;
    println!("Sample data ready ({} rows created)", data.created);
    println!("  facility {}", data.facility_id);
    println!("  doctor   {}", data.doctor_id);
    println!("  patient  {}", data.patient_id);
    Ok(())
}

fn run_verify_audit(settings: &Settings) -> Result<()> {
    let conn = db::open_role_connection(&settings.database_path, DbRole::Reporting)?;
    let result = db::verify_chain(&conn)?;
    match result.first_broken_seq {
        None => {
            println!("Audit trail intact ({} entries)", result.entries_checked);
            Ok(())
        }
        Some(seq) => bail!(
            "audit trail broken at entry {seq} ({} entries checked)",
            result.entries_checked
        ),
    }
}

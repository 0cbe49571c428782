use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use sqlx::SqlitePool;

use vdm_broker::Broker;
use vdm_core::config::Config;
use vdm_core::MachineStatus;
use vdm_store::{create_pool, migrate, AssignmentStore, StaticMachine, StaticMachineStore};
use vdm_vms::{Machine, VmFleet};

use crate::display::{self, MachineRow};
use crate::logging;

#[derive(Parser)]
#[command(name = "vdmctl", version, about = "Virtual desktop machine fleet broker")]
struct Cli {
    /// Path to the config file (overridden by VDM_CONFIG)
    #[arg(long, global = true, default_value = "vdm.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operate on machines in the active fleet
    Machine {
        #[command(subcommand)]
        action: MachineCmd,
    },

    /// Inspect and grow the warm pool
    Pool {
        #[command(subcommand)]
        action: PoolCmd,
    },

    /// Find or create the machine for a user and wait until it is usable
    Allocate {
        /// User identifier to allocate for
        user_id: String,
    },

    /// List machine types offered by the backend
    Types,
}

#[derive(Subcommand)]
enum MachineCmd {
    /// List all machines known to the backend
    List,
    /// Show one machine
    Show { id: String },
    /// Power a machine on
    Start { id: String },
    /// Power a machine off
    Stop { id: String },
    /// Terminate a machine and delete its assignment record
    Terminate { id: String },
    /// Register a pre-provisioned machine as a free pool entry (static backend)
    Register {
        id: String,
        /// Public address of the machine
        address: String,
        #[arg(long, default_value = "preregistered desktop")]
        name: String,
        #[arg(long, default_value_t = vdm_vms::drivers::AGENT_PORT)]
        agent_port: u16,
        #[arg(long, default_value = "Administrator")]
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Subcommand)]
enum PoolCmd {
    /// Show assignment records and pool occupancy
    Status,
    /// Create machines and add them to the pool as free
    Grow {
        #[arg(default_value_t = 1)]
        count: u32,
    },
}

struct App {
    pool: SqlitePool,
    broker: Broker,
    fleet: Arc<dyn VmFleet>,
    assignments: AssignmentStore,
}

impl App {
    async fn build(config: &Config) -> Result<Self> {
        let pool = create_pool(&config.store.url)
            .await
            .with_context(|| format!("cannot open store {}", config.store.url))?;
        migrate(&pool).await.context("schema migration failed")?;

        let fleet =
            vdm_vms::open(&config.driver, pool.clone()).context("cannot open VM driver")?;
        let assignments = AssignmentStore::new(pool.clone());
        let broker = Broker::new(assignments.clone(), fleet.clone(), config.broker.clone());
        Ok(Self {
            pool,
            broker,
            fleet,
            assignments,
        })
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init();

    let config_path =
        std::env::var("VDM_CONFIG").unwrap_or_else(|_| cli.config.clone());
    let config = Config::load(&config_path)
        .with_context(|| format!("cannot load config {config_path}"))?;

    let runtime = tokio::runtime::Runtime::new().context("cannot start async runtime")?;
    runtime.block_on(dispatch(cli.command, &config))
}

async fn dispatch(command: Commands, config: &Config) -> Result<()> {
    let app = App::build(config).await?;
    match command {
        Commands::Machine { action } => machine_cmd(&app, action).await,
        Commands::Pool { action } => pool_cmd(&app, action).await,
        Commands::Allocate { user_id } => allocate(&app, &user_id).await,
        Commands::Types => {
            let types = app.fleet.types().await?;
            display::print_types(&types);
            Ok(())
        }
    }
}

async fn machine_cmd(app: &App, action: MachineCmd) -> Result<()> {
    match action {
        MachineCmd::List => {
            let mut rows = Vec::new();
            for machine in app.fleet.machines().await? {
                rows.push(machine_row(app, machine.as_ref()).await);
            }
            display::print_machines(&rows);
        }
        MachineCmd::Show { id } => {
            let machine = app.fleet.machine(&id).await?;
            let row = machine_row(app, machine.as_ref()).await;
            display::print_machines(std::slice::from_ref(&row));
        }
        MachineCmd::Start { id } => {
            app.fleet.machine(&id).await?.start().await?;
            println!("start issued for {id}");
        }
        MachineCmd::Stop { id } => {
            app.fleet.machine(&id).await?.stop().await?;
            println!("stop issued for {id}");
        }
        MachineCmd::Terminate { id } => {
            app.fleet.machine(&id).await?.terminate().await?;
            println!("terminated {id}");
        }
        MachineCmd::Register {
            id,
            address,
            name,
            agent_port,
            username,
            password,
        } => {
            let statics = StaticMachineStore::new(app.pool.clone());
            statics
                .insert(&StaticMachine {
                    id: id.clone(),
                    name,
                    address,
                    agent_port,
                    username,
                    password,
                })
                .await?;
            app.assignments.insert_free(&id).await?;
            println!("registered {id}");
        }
    }
    Ok(())
}

async fn pool_cmd(app: &App, action: PoolCmd) -> Result<()> {
    match action {
        PoolCmd::Status => {
            let records = app.assignments.list().await?;
            let free = records.iter().filter(|r| r.user_id.is_none()).count();
            println!("{} machines recorded, {} free", records.len(), free);
            for record in records {
                println!(
                    "{:<24} {}",
                    record.machine_id,
                    record.user_id.as_deref().unwrap_or("-"),
                );
            }
        }
        PoolCmd::Grow { count } => {
            app.broker.upgrade_pool(count).await?;
            println!("pool grown by {count}");
        }
    }
    Ok(())
}

async fn allocate(app: &App, user_id: &str) -> Result<()> {
    let machine = app
        .broker
        .get_machine(user_id)
        .await
        .with_context(|| format!("allocation for {user_id}"))?;

    let name = machine.name().await.unwrap_or_default();
    let ip = machine
        .ip()
        .await
        .ok()
        .flatten()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string());
    let username = machine
        .credentials()
        .await
        .map(|c| c.username)
        .unwrap_or_default();

    println!("machine:  {}", machine.id());
    println!("name:     {name}");
    println!("address:  {ip}");
    println!("username: {username}");
    Ok(())
}

async fn machine_row(app: &App, machine: &dyn Machine) -> MachineRow {
    let status = match machine.status().await {
        Ok(status) => status,
        Err(err) => {
            warn!(machine_id = machine.id(), error = %err, "status query failed");
            MachineStatus::Unknown
        }
    };
    let ip = machine
        .ip()
        .await
        .ok()
        .flatten()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string());
    let name = machine.name().await.unwrap_or_default();
    let owner = match app.assignments.get(machine.id()).await {
        Ok(Some(record)) => record.user_id.unwrap_or_else(|| "-".to_string()),
        _ => "-".to_string(),
    };
    MachineRow {
        id: machine.id().to_string(),
        name,
        status,
        ip,
        owner,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_allocate_parses_user() {
        let cli = Cli::try_parse_from(["vdmctl", "allocate", "alice"]).unwrap();
        match cli.command {
            Commands::Allocate { user_id } => assert_eq!(user_id, "alice"),
            _ => panic!("expected allocate"),
        }
    }

    #[test]
    fn test_pool_grow_defaults_to_one() {
        let cli = Cli::try_parse_from(["vdmctl", "pool", "grow"]).unwrap();
        match cli.command {
            Commands::Pool {
                action: PoolCmd::Grow { count },
            } => assert_eq!(count, 1),
            _ => panic!("expected pool grow"),
        }
    }
}

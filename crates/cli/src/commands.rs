//! Subcommands.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Subcommand;
use corelib::{
    Address, GridConfig, HashPartitioner, InMemoryMembership, Member, MemberList,
    MembershipService, PartitionTable, Partitioner,
};
use grid::{LocalNetwork, NodeEngine, PartitionServiceState};
use migration::{MigrationEvent, MigrationListener};
use tracing::info;

const SIMULATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the balanced arrangement for a member list.
    Assign {
        /// Members as host:port, comma separated.
        #[arg(required = true, value_delimiter = ',')]
        members: Vec<Address>,

        /// Print the full partition table as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the migrations that take the table from one member list to
    /// another.
    Plan {
        #[arg(long, required = true, value_delimiter = ',')]
        from: Vec<Address>,

        #[arg(long, required = true, value_delimiter = ',')]
        to: Vec<Address>,
    },

    /// Print the partition and replica holders of each key.
    Locate {
        #[arg(long, required = true, value_delimiter = ',')]
        members: Vec<Address>,

        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Run an in-process cluster through member joins and departures.
    Simulate {
        /// Members present from the start.
        #[arg(long, default_value_t = 1)]
        members: usize,

        /// Members joining one after another.
        #[arg(long, default_value_t = 1)]
        join: usize,

        /// Members leaving after the joins, newest first.
        #[arg(long, default_value_t = 0)]
        leave: usize,
    },

    /// Print the effective configuration as JSON.
    Config,
}

/// Output of a command.
#[derive(Debug)]
pub enum CommandResult {
    Text(String),
    Json(serde_json::Value),
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text.trim_end()),
            Self::Json(value) => match serde_json::to_string_pretty(value) {
                Ok(json) => f.write_str(&json),
                Err(_) => Err(fmt::Error),
            },
        }
    }
}

impl Command {
    pub fn execute(&self, config: &GridConfig) -> anyhow::Result<CommandResult> {
        match self {
            Self::Assign { members, json } => assign(config, members, *json),
            Self::Plan { from, to } => plan(config, from, to),
            Self::Locate { members, keys } => locate(config, members, keys),
            Self::Simulate {
                members,
                join,
                leave,
            } => simulate(config, *members, *join, *leave),
            Self::Config => Ok(CommandResult::Json(serde_json::to_value(config)?)),
        }
    }
}

fn arranged(config: &GridConfig, members: &[Address]) -> anyhow::Result<PartitionTable> {
    let mut sorted = members.to_vec();
    sorted.sort();
    sorted.dedup();
    let table = PartitionTable::new(config.partition_count, config.replica_count())?;
    table.initialize(&table.compute_target(&sorted))?;
    Ok(table)
}

fn assign(config: &GridConfig, members: &[Address], json: bool) -> anyhow::Result<CommandResult> {
    let table = arranged(config, members)?;
    if json {
        return Ok(CommandResult::Json(serde_json::to_value(table.snapshot())?));
    }

    let mut counts: BTreeMap<&Address, (usize, usize)> =
        members.iter().map(|m| (m, (0, 0))).collect();
    for partition in table.partitions() {
        for (index, holder) in partition.replicas().iter().enumerate() {
            let Some(holder) = holder else { continue };
            if let Some((owned, backups)) = counts.get_mut(holder) {
                if index == 0 {
                    *owned += 1;
                } else {
                    *backups += 1;
                }
            }
        }
    }

    let mut out = String::new();
    writeln!(
        out,
        "{} partitions, {} replicas each",
        config.partition_count,
        config.replica_count()
    )?;
    for (member, (owned, backups)) in counts {
        writeln!(out, "{member:<24} owner {owned:>5}  backup {backups:>5}")?;
    }
    Ok(CommandResult::Text(out))
}

fn plan(config: &GridConfig, from: &[Address], to: &[Address]) -> anyhow::Result<CommandResult> {
    let table = arranged(config, from)?;
    let mut members = to.to_vec();
    members.sort();
    members.dedup();
    let migrations = table.compute_rebalance(&members);

    let mut out = String::new();
    let owner_moves = migrations.iter().filter(|m| m.replica_index == 0).count();
    writeln!(
        out,
        "{} migrations ({owner_moves} owner hand-offs)",
        migrations.len()
    )?;
    for migration in &migrations {
        writeln!(out, "{migration}")?;
    }
    Ok(CommandResult::Text(out))
}

fn locate(config: &GridConfig, members: &[Address], keys: &[String]) -> anyhow::Result<CommandResult> {
    let table = arranged(config, members)?;
    let partitioner = HashPartitioner::new(config.partition_count)?;
    let mut out = String::new();
    for key in keys {
        let partition_id = partitioner.partition_id(key.as_bytes());
        let holders: Vec<String> = table
            .get_partition(partition_id)?
            .replicas()
            .iter()
            .flatten()
            .map(Address::to_string)
            .collect();
        writeln!(out, "{key:<24} partition {partition_id:>5}  {}", holders.join(" "))?;
    }
    Ok(CommandResult::Text(out))
}

#[derive(Default)]
struct Tally {
    started: AtomicU32,
    completed: AtomicU32,
    failed: AtomicU32,
}

impl MigrationListener for Tally {
    fn migration_started(&self, _: &MigrationEvent) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn migration_completed(&self, _: &MigrationEvent) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    fn migration_failed(&self, _: &MigrationEvent) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

fn simulated_address(i: usize) -> Address {
    Address::new(format!("member-{i}"), 5701)
}

fn simulate(
    config: &GridConfig,
    initial: usize,
    joining: usize,
    leaving: usize,
) -> anyhow::Result<CommandResult> {
    if initial == 0 {
        bail!("a simulation needs at least one initial member");
    }
    if leaving >= initial + joining {
        bail!("the master cannot leave the simulation");
    }
    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(run_simulation(config.clone(), initial, joining, leaving))
}

fn report(out: &mut String, change: &str, members: usize, tally: &Tally, settled: bool) -> fmt::Result {
    writeln!(
        out,
        "{change} -> {members} members: {} started, {} completed, {} failed{}",
        tally.started.load(Ordering::Relaxed),
        tally.completed.load(Ordering::Relaxed),
        tally.failed.load(Ordering::Relaxed),
        if settled { "" } else { " (not settled)" }
    )
}

async fn run_simulation(
    config: GridConfig,
    initial: usize,
    joining: usize,
    leaving: usize,
) -> anyhow::Result<CommandResult> {
    let network = LocalNetwork::new();
    let mut views: Vec<Arc<InMemoryMembership>> = Vec::new();
    let mut engines: Vec<Arc<NodeEngine>> = Vec::new();
    let tally = Arc::new(Tally::default());
    let mut out = String::new();

    let start_member = |i: usize, members: &[Member]| -> anyhow::Result<_> {
        let address = simulated_address(i);
        let view = Arc::new(InMemoryMembership::new(Member::new(
            address.clone(),
            format!("member-{i}"),
        )));
        view.merge_from(&MemberList {
            version: 1,
            members: members.to_vec(),
        });
        let engine = NodeEngine::start(config.clone(), address, view.clone(), network.clone())?;
        Ok((view, engine))
    };

    let founders: Vec<Member> = (0..initial)
        .map(|i| Member::new(simulated_address(i), format!("member-{i}")))
        .collect();
    for i in 0..initial {
        let (view, engine) = start_member(i, &founders)?;
        views.push(view);
        engines.push(engine);
    }
    engines[0].add_migration_listener(Some(tally.clone()))?;

    for i in initial..initial + joining {
        let mut members = views[0].member_list().members;
        let member = Member::new(simulated_address(i), format!("member-{i}"));
        members.push(member.clone());
        let (view, engine) = start_member(i, &members)?;
        for existing in &views {
            existing.add_member(member.clone());
        }
        views.push(view);
        engines.push(engine);

        info!(member = %member.address, "simulated member joining");
        let settled = settle(&engines[0]).await;
        let change = format!("join of {}", member.address);
        report(&mut out, &change, engines.len(), &tally, settled)?;
    }

    for _ in 0..leaving {
        let (Some(view), Some(engine)) = (views.pop(), engines.pop()) else {
            break;
        };
        let address = view.local_address();
        info!(member = %address, "simulated member leaving");
        engine.shutdown();
        for existing in &views {
            existing.remove_member(&address);
        }
        let settled = settle(&engines[0]).await;
        let change = format!("departure of {address}");
        report(&mut out, &change, engines.len(), &tally, settled)?;
    }

    let master = &engines[0];
    writeln!(out, "state: {}", master.partition_service_state())?;
    let parked: usize = engines
        .iter()
        .map(|e| e.get_total_parked_operation_count())
        .sum();
    writeln!(out, "parked operations: {parked}")?;
    for engine in &engines {
        let owned = master
            .partition_table()
            .partitions_owned_by(engine.local_address())
            .len();
        writeln!(out, "{:<24} owner {owned:>5}", engine.local_address())?;
    }
    for engine in &engines {
        engine.shutdown();
    }
    Ok(CommandResult::Text(out))
}

/// Waits for the master's migrations and anti-entropy to finish.
async fn settle(master: &NodeEngine) -> bool {
    let deadline = tokio::time::Instant::now() + SIMULATION_TIMEOUT;
    // the join is picked up by the membership listener task
    tokio::time::sleep(Duration::from_millis(20)).await;
    if !master.coordinator().await_idle(SIMULATION_TIMEOUT).await {
        return false;
    }
    while master.partition_service_state() != PartitionServiceState::Safe {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vacwatch_core::{FilterSet, ListingRecord, User, UserId};
use vacwatch_storage::{PgStore, Store};
use vacwatch_notify::format_salary;
use vacwatch_sync::{build_listing_search, build_pipeline, Scheduler, UserCheckOutcome, WatchConfig};

#[derive(Debug, Parser)]
#[command(name = "vacwatch-cli")]
#[command(about = "Vacancy Watch: poll job listings and notify subscribed users")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the polling scheduler until interrupted.
    Run,
    /// Run a single check cycle, or check one user.
    Check {
        #[arg(long)]
        user: Option<i64>,
    },
    /// Show the listings a user's filters currently match, without notifying or recording anything.
    Search {
        #[arg(long)]
        user: i64,
    },
    /// Apply database migrations.
    Migrate,
    #[command(subcommand)]
    User(UserCommand),
    #[command(subcommand)]
    Filter(FilterCommand),
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Register a user (no-op if the id is known).
    Add {
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        username: Option<String>,
        /// Free-text query used when the user has no structured filters.
        #[arg(long)]
        legacy_filter: Option<String>,
    },
    Activate {
        id: i64,
    },
    Deactivate {
        id: i64,
    },
    /// Print a user's flags and search settings.
    Status {
        id: i64,
    },
}

#[derive(Debug, Subcommand)]
enum FilterCommand {
    /// Store one filter; VALUE is parsed as JSON and kept as a string otherwise.
    Set {
        user: i64,
        name: String,
        value: String,
    },
    List {
        user: i64,
    },
    /// Remove one filter, or all of them when no name is given.
    Clear {
        user: i64,
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn parse_filter_value(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

fn describe_filters(filters: Option<&FilterSet>) -> String {
    match filters {
        Some(filters) if !filters.is_empty() => {
            let mut out = String::new();
            for (name, value) in filters.iter() {
                let _ = writeln!(out, "  {name} = {value}");
            }
            out
        }
        _ => "  (none)\n".to_string(),
    }
}

fn describe_user(user: &User, filters: Option<&FilterSet>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "user {} ({})", user.id, user.display_name);
    if let Some(username) = &user.username {
        let _ = writeln!(out, "username: @{username}");
    }
    let _ = writeln!(out, "active: {}", user.is_active);
    let _ = writeln!(out, "created: {}", user.created_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(
        out,
        "legacy filter: {}",
        user.legacy_filter_text().unwrap_or("(none)")
    );
    out.push_str("filters:\n");
    out.push_str(&describe_filters(filters));
    out
}

fn describe_listing(listing: &ListingRecord) -> String {
    let salary = listing
        .salary
        .as_ref()
        .map(format_salary)
        .unwrap_or_else(|| "salary not specified".to_string());
    format!(
        "[{}] {} | {} | {} | {}",
        listing.external_id, listing.title, listing.employer_name, salary, listing.url
    )
}

async fn load_user(store: &dyn Store, id: i64) -> Result<(User, Option<FilterSet>)> {
    let user = store
        .get_user(UserId(id))
        .await?
        .with_context(|| format!("user {id} not found"))?;
    let filters = store.get_filter_set(user.id).await?;
    Ok((user, filters))
}

async fn connect(config: &WatchConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = WatchConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let store = connect(&config).await?;
            let pipeline = build_pipeline(&config, store)?;
            let scheduler = Scheduler::new(Arc::new(pipeline), config.schedule_timing());

            scheduler.start().await?;
            info!(interval_secs = config.check_interval_secs, "vacancy watch running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutdown requested");
            scheduler.stop().await;
        }
        Commands::Check { user } => {
            let store = connect(&config).await?;
            let pipeline = build_pipeline(&config, store.clone())?;
            match user {
                Some(id) => {
                    let user = store
                        .get_user(UserId(id))
                        .await?
                        .with_context(|| format!("user {id} not found"))?;
                    match pipeline.check_user(&user).await? {
                        UserCheckOutcome::Checked(report) => println!(
                            "user {id}: seen={} notified={} already_notified={} failed={}",
                            report.listings_seen,
                            report.notified,
                            report.already_notified,
                            report.failed
                        ),
                        UserCheckOutcome::Skipped(reason) => {
                            println!("user {id}: skipped ({reason:?})")
                        }
                    }
                }
                None => {
                    let scheduler = Scheduler::new(Arc::new(pipeline), config.schedule_timing());
                    let summary = scheduler.run_cycle().await?;
                    println!(
                        "cycle complete: run_id={} users={} checked={} skipped={} failed={} sent={}",
                        summary.run_id,
                        summary.users_total,
                        summary.users_checked,
                        summary.users_skipped,
                        summary.users_failed,
                        summary.notifications_sent
                    );
                }
            }
        }
        Commands::Search { user } => {
            let store = connect(&config).await?;
            let search = build_listing_search(&config)?;
            let (user, filters) = load_user(store.as_ref(), user).await?;
            match search.search_for(&user, filters.as_ref()).await {
                None => println!("user {}: no usable filters", user.id),
                Some(listings) => {
                    println!("user {}: {} listings", user.id, listings.len());
                    for listing in &listings {
                        println!("{}", describe_listing(listing));
                    }
                }
            }
        }
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::User(command) => {
            let store = connect(&config).await?;
            match command {
                UserCommand::Add {
                    id,
                    name,
                    username,
                    legacy_filter,
                } => {
                    let mut user = User::new(UserId(id), name);
                    user.username = username;
                    let user = store.get_or_create_user(user).await?;
                    if let Some(filter) = legacy_filter {
                        store.set_legacy_filter(user.id, Some(&filter)).await?;
                    }
                    println!("user {} ready (active={})", user.id, user.is_active);
                }
                UserCommand::Activate { id } => set_active(store.as_ref(), id, true).await?,
                UserCommand::Deactivate { id } => set_active(store.as_ref(), id, false).await?,
                UserCommand::Status { id } => {
                    let (user, filters) = load_user(store.as_ref(), id).await?;
                    print!("{}", describe_user(&user, filters.as_ref()));
                }
            }
        }
        Commands::Filter(command) => {
            let store = connect(&config).await?;
            match command {
                FilterCommand::List { user } => {
                    let (_, filters) = load_user(store.as_ref(), user).await?;
                    println!("filters for user {user}:");
                    print!("{}", describe_filters(filters.as_ref()));
                }
                FilterCommand::Set { user, name, value } => {
                    ensure_user(store.as_ref(), user).await?;
                    store
                        .save_filter(UserId(user), &name, parse_filter_value(&value))
                        .await?;
                    println!("filter {name} saved for user {user}");
                }
                FilterCommand::Clear { user, name } => match name {
                    Some(name) => {
                        let removed = store.delete_filter(UserId(user), &name).await?;
                        println!("filter {name} removed for user {user}: {removed}");
                    }
                    None => {
                        let removed = store.clear_filters(UserId(user)).await?;
                        println!("{removed} filters removed for user {user}");
                    }
                },
            }
        }
    }

    Ok(())
}

async fn ensure_user(store: &dyn Store, id: i64) -> Result<()> {
    if store.get_user(UserId(id)).await?.is_none() {
        bail!("user {id} not found; add it with `user add` first");
    }
    Ok(())
}

async fn set_active(store: &dyn Store, id: i64, active: bool) -> Result<()> {
    if !store.set_user_active(UserId(id), active).await? {
        bail!("user {id} not found");
    }
    println!("user {id} active={active}");
    Ok(())
}

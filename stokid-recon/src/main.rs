//! stokid - stock identity maintenance tool
//!
//! Runs the reconciliation engine passes against a stokid store:
//! deduplication, batch reconciliation, sale resolution and reversal,
//! sale backfill, and a read-only integrity check. Reports are printed
//! to stdout as JSON.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use stokid_common::config::{resolve_database_path, TomlConfig};
use stokid_recon::batch::load_batch_file;
use stokid_recon::deduplicator::Deduplicator;
use stokid_recon::integrity::IntegrityChecker;
use stokid_recon::reconciler::Reconciler;
use stokid_recon::sale_resolver::{SaleAttempt, SaleRequest, SaleResolver, SaleState};
use stokid_recon::{Candidate, IdentityStore};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(name = "stokid", version)]
#[clap(about = "Stock variant identity reconciliation and deduplication")]
struct Args {
    /// Database file (overrides STOKID_DATABASE and the config file)
    #[clap(long, global = true, value_name = "PATH")]
    database: Option<PathBuf>,

    /// TOML config file (overrides STOKID_CONFIG)
    #[clap(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge duplicate stock variants and re-point their sales
    Dedup,

    /// Reconcile a JSON product batch (array or snapshot object) into the store
    Reconcile {
        #[clap(value_name = "FILE")]
        file: PathBuf,

        /// Commit every entry on its own instead of one batch transaction
        #[clap(long)]
        per_entry: bool,
    },

    /// Show which in-stock variant a barcode resolves to
    Resolve { barcode: String },

    /// Record a sale for a scanned barcode
    Sell {
        barcode: String,

        #[clap(long)]
        quantity: i64,

        /// Unit price charged
        #[clap(long)]
        price: f64,

        /// Identity to sell when the barcode has several in-stock variants
        #[clap(long, value_name = "IDENTITY")]
        select: Option<String>,

        #[clap(long, default_value = "")]
        customer_id: String,

        #[clap(long, default_value = "")]
        customer_name: String,

        /// Record as sold on credit
        #[clap(long)]
        debt: bool,
    },

    /// Reverse (return) a recorded sale
    Reverse { sale_id: i64 },

    /// Fill in missing identities on historical sales
    Backfill,

    /// Give legacy stock rows without an identity a fresh one
    AssignIdentities,

    /// Report duplicates, missing identities and dangling references
    Check,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The log level lives in the config file, so config loading reports
    // through a temporary stderr subscriber.
    let bootstrap = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let toml_config = tracing::subscriber::with_default(bootstrap, || TomlConfig::load(args.config.as_deref()));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&toml_config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let db_path = resolve_database_path(args.database.as_deref(), &toml_config);
    info!("Database: {}", db_path.display());

    let pool = stokid_common::db::init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;
    let store = IdentityStore::new(pool.clone());

    match args.command {
        Command::Dedup => {
            let report = Deduplicator::new(store).run().await?;
            print_json(&report)?;
        }
        Command::Reconcile { file, per_entry } => {
            let batch = load_batch_file(&file)
                .with_context(|| format!("Failed to read batch {}", file.display()))?;
            let mode = stokid_recon::config::resolve_batch_mode(&pool, &toml_config, per_entry).await?;
            let report = Reconciler::new(store, mode).reconcile(&batch).await?;
            print_json(&report)?;
        }
        Command::Resolve { barcode } => {
            let resolver = SaleResolver::new(store);
            let attempt = SaleAttempt::scan(barcode).lookup(&resolver).await?;
            match attempt.state() {
                SaleState::SingleCandidate(variant) => print_json(&Candidate::from(variant))?,
                SaleState::MultiCandidate { candidates, .. } => {
                    let listed: Vec<Candidate> = candidates.iter().map(Candidate::from).collect();
                    print_json(&listed)?;
                }
                SaleState::NoStock { barcode } => bail!("No stock available for barcode {}", barcode),
                other => bail!("Unexpected lookup state {:?}", other),
            }
        }
        Command::Sell {
            barcode,
            quantity,
            price,
            select,
            customer_id,
            customer_name,
            debt,
        } => {
            let resolver = SaleResolver::new(store);
            let attempt = SaleAttempt::scan(barcode).lookup(&resolver).await?;
            if let SaleState::NoStock { barcode } = attempt.state() {
                bail!("No stock available for barcode {}", barcode);
            }

            let mut attempt = attempt.proceed()?;
            if !attempt.is_terminal() {
                match &select {
                    Some(identity_id) => attempt = attempt.select(&resolver, identity_id).await?,
                    None => {
                        if let SaleState::AwaitingSelection { barcode, candidates } = attempt.state() {
                            let listed: Vec<Candidate> = candidates.iter().map(Candidate::from).collect();
                            print_json(&listed)?;
                            bail!(
                                "Barcode {} has {} in-stock variants; rerun with --select <IDENTITY>",
                                barcode,
                                listed.len()
                            );
                        }
                        attempt = attempt.abandon()?;
                    }
                }
            }

            let variant = attempt
                .resolved()
                .context("Sale attempt did not resolve to a variant")?
                .clone();
            if let Some(identity_id) = &select {
                if identity_id.trim() != variant.identity_id {
                    bail!(
                        "Barcode resolves to {}, not the selected {}",
                        variant.identity_id,
                        identity_id
                    );
                }
            }

            let request = SaleRequest {
                is_debt: debt,
                customer_id,
                customer_name,
                ..SaleRequest::new(quantity, price)
            };
            let sale = resolver.complete_sale(&variant, &request).await?;
            print_json(&sale)?;
        }
        Command::Reverse { sale_id } => {
            let reversal = SaleResolver::new(store).reverse_sale(sale_id).await?;
            print_json(&reversal)?;
        }
        Command::Backfill => {
            let report = SaleResolver::new(store).backfill_all().await?;
            print_json(&report)?;
        }
        Command::AssignIdentities => {
            let assigned = store.assign_missing_identities().await?;
            print_json(&serde_json::json!({ "assigned": assigned }))?;
        }
        Command::Check => {
            let report = IntegrityChecker::new(store).run().await?;
            print_json(&report)?;
        }
    }

    pool.close().await;
    Ok(())
}

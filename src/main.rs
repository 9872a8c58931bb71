use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tracing::info;

use tagledger::{
    apply_all_rules, apply_rule, compile, create_rule, delete_rule, insert_transactions,
    list_rules, load_csv, open_database, reload_and_reclassify, verify_count, NewRule, QueryParams, RuleSource,
    Settings, TransactionQuery,
};

#[derive(Parser, Debug)]
#[command(name = "tagledger")]
#[command(about = "Tag bank transactions with rules and query them with filters")]
struct Cli {
    /// Settings file (TOML); `TAGLEDGER_*` environment variables override it
    #[arg(long, short, env = "TAGLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overrides `database.path`
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import transactions from a CSV file
    Import { csv: PathBuf },
    /// Compile a rule and print the SQL fragment with its parameters
    Compile { rule: String },
    /// Query transactions
    Query(QueryArgs),
    /// Manage stored rules
    Rules(Rules),
    /// Clear tags and apply every stored rule
    ApplyRules,
    /// Reload the classifier rule file and reclassify all transactions
    Reclassify {
        /// Rule file, overrides `rules.file`
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct QueryArgs {
    #[arg(long)]
    rule: Option<String>,
    #[arg(long)]
    rule_id: Option<i64>,
    /// Filter object as JSON, e.g. '{"tags":{"in":["Food"]}}'
    #[arg(long)]
    filter: Option<String>,
    /// "column,direction"
    #[arg(long)]
    order_by: Option<String>,
    #[arg(long)]
    page: Option<u32>,
    #[arg(long)]
    page_size: Option<u32>,
}

#[derive(Args, Debug)]
struct Rules {
    #[command(subcommand)]
    command: RulesCommand,
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    List,
    Add {
        rule: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        party: Vec<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        comment: Option<String>,
    },
    Delete { id: i64 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(format!("tagledger={}", settings.log.level))
                }),
        )
        .init();

    let db_path = cli.database.clone().unwrap_or_else(|| settings.database.path.clone());

    match cli.command {
        Command::Compile { rule } => run_compile(&rule),
        Command::Import { csv } => run_import(&open(&db_path)?, &csv),
        Command::Query(args) => run_query(&open(&db_path)?, &settings, args),
        Command::Rules(rules) => run_rules(&open(&db_path)?, rules.command),
        Command::ApplyRules => {
            let report = apply_all_rules(&open(&db_path)?, None)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Reclassify { rules } => {
            let path = rules.unwrap_or_else(|| settings.rules.file.clone());
            let source = RuleSource::File(path.clone());
            let report = reload_and_reclassify(&open(&db_path)?, &source)
                .with_context(|| format!("Failed to reclassify with rules from {:?}", path))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn open(db_path: &Path) -> Result<Connection> {
    open_database(db_path).with_context(|| format!("Failed to open database {:?}", db_path))
}

fn run_compile(rule: &str) -> Result<()> {
    let compiled = compile(rule)?;
    println!("{}", compiled.sql);
    for (i, param) in compiled.params.iter().enumerate() {
        println!("  ?{} = {}", i + 1, param);
    }
    Ok(())
}

fn run_import(conn: &Connection, csv: &Path) -> Result<()> {
    let transactions =
        load_csv(csv).with_context(|| format!("Failed to load transactions from {:?}", csv))?;
    let inserted = insert_transactions(conn, &transactions)?;
    let count = verify_count(conn)?;

    info!(loaded = transactions.len(), inserted, total = count, "import finished");
    println!("Imported {} of {} transactions ({} in database)", inserted, transactions.len(), count);
    Ok(())
}

fn run_query(conn: &Connection, settings: &Settings, args: QueryArgs) -> Result<()> {
    let params = QueryParams {
        rule: args.rule,
        ruleid: args.rule_id,
        filter: args.filter,
        order_by: args.order_by,
        page: args.page,
        page_size: args.page_size,
    };
    let query = TransactionQuery::build(conn, &params, &settings.page_limits())?;

    let rows = query.transactions(conn, true)?;
    let summary = query.summary(conn)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "summary": summary,
            "transactions": rows,
        }))?
    );
    Ok(())
}

fn run_rules(conn: &Connection, command: RulesCommand) -> Result<()> {
    match command {
        RulesCommand::List => {
            for summary in list_rules(conn)? {
                let rule = &summary.rule;
                println!(
                    "{:>4}  {:<40}  {:?}  ({} txns)",
                    rule.id, rule.rule, rule.tags, summary.tx_count
                );
            }
        }
        RulesCommand::Add {
            rule,
            tags,
            party,
            group,
            comment,
        } => {
            let created = create_rule(
                conn,
                &NewRule {
                    rule,
                    group,
                    tags,
                    party,
                    comment,
                },
            )?;
            let matched = apply_rule(conn, &created, None)?;
            println!("Rule {} created and classified {} txns", created.id, matched);
        }
        RulesCommand::Delete { id } => {
            delete_rule(conn, id)?;
            println!("Rule {} deleted", id);
        }
    }
    Ok(())
}

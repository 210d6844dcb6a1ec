use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hhv_db::{AssumeYes, Confirm, LoadOptions, LoadOutcome, PgTableStore, TableLoader, VacancyQueries};
use hhv_sync::{
    collect_report, render_keyword_matches, render_report, Dataset, StageSummary, SyncConfig,
    SyncPipeline,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hhv-cli")]
#[command(about = "Collect hh.ru employers and vacancies into CSV files and PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive end-to-end run: fetch, load, report.
    Run(RunArgs),
    /// Replace the employers CSV with the results of a name search.
    FetchEmployers { name: String },
    /// Append one employer's vacancies to the vacancies CSV.
    FetchVacancies { employer_id: String },
    /// Load a CSV file into its table.
    Load {
        dataset: Dataset,
        #[command(flatten)]
        load: LoadArgs,
    },
    /// Print the aggregate report.
    Report {
        #[arg(long)]
        keyword: Option<String>,
    },
}

#[derive(Debug, Default, Args)]
struct LoadArgs {
    /// Answer yes to every table confirmation.
    #[arg(long)]
    yes: bool,
    /// Skip rows whose identity already exists in the table.
    #[arg(long)]
    skip_existing: bool,
}

impl LoadArgs {
    fn options(&self) -> LoadOptions {
        LoadOptions {
            skip_existing: self.skip_existing,
            ..LoadOptions::default()
        }
    }

    fn confirm(&self) -> Box<dyn Confirm> {
        if self.yes {
            Box::new(AssumeYes)
        } else {
            Box::new(ConsoleConfirm)
        }
    }
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Employer name to search for; prompted when absent.
    #[arg(long)]
    employer: Option<String>,
    /// Employer id whose vacancies are fetched; prompted when absent.
    #[arg(long)]
    employer_id: Option<String>,
    /// Keyword for the vacancy title search; prompted when absent.
    #[arg(long)]
    keyword: Option<String>,
    #[command(flatten)]
    load: LoadArgs,
}

struct ConsoleConfirm;

impl Confirm for ConsoleConfirm {
    fn confirm(&self, prompt: &str) -> bool {
        match ask(&format!("{prompt} (yes/no): ")) {
            Ok(answer) => is_affirmative(&answer),
            Err(err) => {
                warn!(error = %err, "could not read confirmation; treating as no");
                false
            }
        }
    }
}

fn is_affirmative(answer: &str) -> bool {
    matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes" | "д" | "да"
    )
}

fn ask(prompt: &str) -> io::Result<String> {
    let mut stdout = io::stdout();
    write!(stdout, "{prompt}")?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn answer_or_ask(value: Option<String>, prompt: &str) -> Result<String> {
    match value {
        Some(value) => Ok(value),
        None => ask(prompt).with_context(|| format!("reading answer to {prompt:?}")),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn print_stage(summary: &StageSummary) {
    println!(
        "{}: fetched={} written={} skipped={} file={}",
        summary.dataset, summary.fetched, summary.written, summary.skipped, summary.csv_path
    );
}

fn print_load(dataset: Dataset, outcome: LoadOutcome) {
    match outcome {
        LoadOutcome::Declined => println!("{dataset}: nothing loaded"),
        LoadOutcome::Created { inserted, skipped } => {
            println!("{dataset}: table created, inserted={inserted} skipped={skipped}")
        }
        LoadOutcome::Appended { inserted, skipped } => {
            println!("{dataset}: appended inserted={inserted} skipped={skipped}")
        }
    }
}

async fn print_report(config: &SyncConfig, keyword: Option<String>) -> Result<()> {
    let queries = VacancyQueries::new(config.db.clone());
    let Some(report) = collect_report(&queries).await? else {
        println!("Tables are empty. Load data first.");
        return Ok(());
    };
    println!("{}", render_report(&report));

    let keyword = answer_or_ask(keyword, "Keyword to search in vacancy titles: ")?;
    let matches = queries
        .vacancies_matching_keyword(&keyword)
        .await
        .with_context(|| format!("searching vacancies for {keyword:?}"))?;
    println!("{}", render_keyword_matches(&keyword, &matches));
    Ok(())
}

async fn run(config: SyncConfig, args: RunArgs) -> Result<()> {
    let pipeline = SyncPipeline::new(config)?;
    let store = PgTableStore::new(pipeline.config().db.clone());
    let loader = TableLoader::new(args.load.options());
    let confirm = args.load.confirm();
    info!(run_id = %pipeline.run_id(), "starting interactive run");

    let employer = answer_or_ask(args.employer, "Employer name: ")?;
    print_stage(&pipeline.fetch_employers(&employer).await?);
    let outcome = pipeline
        .load_table(&loader, &store, &*confirm, Dataset::Employers)
        .await?;
    print_load(Dataset::Employers, outcome);

    let employer_id = answer_or_ask(
        args.employer_id,
        &format!(
            "Employer id (see {}): ",
            pipeline.config().csv_path(Dataset::Employers).display()
        ),
    )?;
    print_stage(&pipeline.fetch_vacancies(&employer_id).await?);
    let outcome = pipeline
        .load_table(&loader, &store, &*confirm, Dataset::Vacancies)
        .await?;
    print_load(Dataset::Vacancies, outcome);

    print_report(pipeline.config(), args.keyword).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await?,
        Commands::FetchEmployers { name } => {
            let pipeline = SyncPipeline::new(config)?;
            print_stage(&pipeline.fetch_employers(&name).await?);
        }
        Commands::FetchVacancies { employer_id } => {
            let pipeline = SyncPipeline::new(config)?;
            print_stage(&pipeline.fetch_vacancies(&employer_id).await?);
        }
        Commands::Load { dataset, load } => {
            let pipeline = SyncPipeline::new(config)?;
            let store = PgTableStore::new(pipeline.config().db.clone());
            let loader = TableLoader::new(load.options());
            let confirm = load.confirm();
            let outcome = pipeline
                .load_table(&loader, &store, &*confirm, dataset)
                .await?;
            print_load(dataset, outcome);
        }
        Commands::Report { keyword } => print_report(&config, keyword).await?,
    }

    Ok(())
}

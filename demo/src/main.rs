mod dataset;

use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use console::style;
use strata::frame::{TableOperator, Value};
use strata::{
    Aggregation, Comparator, Condition, Diagnostics, ExecutionPlan, Executor, Hash32, Primary,
    Task,
};

#[derive(Parser, Debug, Clone)]
struct Args {
    /// Number of synthetic sales records.
    #[clap(long, default_value_t = 10_000)]
    records: usize,

    /// Seed of the dataset generator.
    #[clap(long, default_value_t = 42)]
    seed: u64,

    /// Pool sizes to compare, comma separated.
    #[clap(long, value_delimiter = ',', default_values_t = [1, 2, 4])]
    pools: Vec<usize>,

    /// JSON task list to run instead of the built-in query.
    #[clap(long)]
    tasks: Option<Utf8PathBuf>,

    /// Per-task timeout in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,

    /// Directory to write `plan.mmd`, `run.mmd` and `waterfall.svg` into.
    #[clap(long)]
    diagnostics: Option<Utf8PathBuf>,
}

/// "Total and average sales per region for 2023 and 2024 orders with a
/// healthy profit, outside the Central region."
fn builtin_tasks() -> Vec<Task> {
    vec![
        Task::filter("T1", [Condition::new("year", Comparator::Ge, 2023)]),
        Task::filter("T2", [Condition::new("profit", Comparator::Gt, 1000)]),
        Task::filter("T3", [Condition::new("region", Comparator::Ne, "Central")]),
        Task::fetch("T4").depends_on_all(["T1", "T2", "T3"]),
        Task::group("T5", ["region"]).depends_on("T4"),
        Task::aggregate("T6", Aggregation::Sum, "sales").depends_on("T5"),
        Task::aggregate("T7", Aggregation::Avg, "sales").depends_on("T5"),
    ]
}

fn main() -> anyhow::Result<()> {
    strata::init_logging()?;
    let args = Args::parse();

    let tasks = match &args.tasks {
        Some(path) => Task::list_from_json(&std::fs::read_to_string(path)?)?,
        None => builtin_tasks(),
    };

    let plan = ExecutionPlan::from_tasks(tasks)?;
    println!("{plan}");

    let data: Value = dataset::generate(args.records, args.seed)?.into();
    println!(
        "{} {} records (seed {})\n",
        style("Dataset:").bold(),
        args.records,
        args.seed
    );

    let mut fingerprints: Vec<(usize, Hash32)> = Vec::new();

    for &pool in &args.pools {
        let mut executor = Executor::new(TableOperator).pool_size(pool);
        if let Some(ms) = args.timeout_ms {
            executor = executor.task_timeout(Duration::from_millis(ms));
        }

        let report = executor.execute(&plan, data.clone())?;

        println!("{}", style(format!("== pool size {pool} ==")).cyan().bold());
        println!("{}", report.metrics());

        for (index, level) in report.level_durations().iter().enumerate() {
            println!("  level {}: {level:.2?}", index + 1);
        }

        for id in report.failures() {
            if let Some(failure) = report.result(id).and_then(|result| result.failure()) {
                println!("  {} {id}: {failure}", style("failed").red());
            }
        }

        fingerprints.push((pool, report.fingerprint()?));

        if Some(&pool) == args.pools.last() {
            println!("\n{}", style("Final result").bold());
            match report.primary() {
                Some(Primary::Single(result)) => print_result(&result.task.to_string(), result.value()),
                Some(Primary::Many(results)) => {
                    for (id, result) in results {
                        print_result(id.as_str(), result.value());
                    }
                }
                None => println!("(empty plan)"),
            }

            if let Some(dir) = &args.diagnostics {
                std::fs::create_dir_all(dir)?;
                let diagnostics = Diagnostics::new(&plan, &report);
                std::fs::write(dir.join("plan.mmd"), plan.render_mermaid())?;
                std::fs::write(dir.join("run.mmd"), diagnostics.render_mermaid())?;
                diagnostics.render_waterfall_to_file(dir.join("waterfall.svg"))?;
                println!("Diagnostics written to {}", style(dir).yellow());
            }
        }
        println!();
    }

    let consistent = fingerprints.windows(2).all(|pair| pair[0].1 == pair[1].1);
    for (pool, hash) in &fingerprints {
        println!("pool {pool:>3}: {hash}");
    }

    if consistent {
        println!("{}", style("Results identical across pool sizes").green());
    } else {
        println!("{}", style("Results differ between pool sizes").red().bold());
    }

    Ok(())
}

fn print_result(id: &str, value: Option<&Value>) {
    match value {
        Some(value) => println!("[{id}]\n{value}"),
        None => println!("[{id}] {}", style("no value").red()),
    }
}

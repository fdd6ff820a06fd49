use clap::Parser;
use std::path::PathBuf;

use dlc::config::DeploymentPlan;
use dlc::pipeline::run_schedule;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Generated C code
    Code,
    /// Final context as JSON
    Context,
    /// Per-level arena usage
    Report,
}

#[derive(Parser, Debug)]
#[command(
    name = "dlc",
    version,
    about = "Deployment Lowering Compiler — lowers scheduled tensor operations to C with explicit memory management"
)]
struct Cli {
    /// Input deployment plan (JSON)
    plan: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Code)]
    emit: EmitStage,

    /// Print pass decisions and timing
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_target(false)
        .init();

    log::debug!("plan   = {}", cli.plan.display());
    log::debug!("emit   = {:?}", cli.emit);

    // ── Load plan ──
    let source = match std::fs::read_to_string(&cli.plan) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("dlc: error: {}: {}", cli.plan.display(), e);
            std::process::exit(2);
        }
    };
    let mut plan = match DeploymentPlan::from_json(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("dlc: {}", dlc::diag::Diagnostic::from(&e));
            std::process::exit(2);
        }
    };
    log::debug!(
        "{} operations, {} passes",
        plan.operations.len(),
        plan.pipeline.len()
    );

    // ── Lower ──
    let transformation = plan.transformation();
    let schedule = plan.schedule();
    let generated = match run_schedule(&mut plan.context, &transformation, schedule, plan.verbosity) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("dlc: {}", e.to_diagnostic());
            std::process::exit(1);
        }
    };

    // ── Emit ──
    let text = match cli.emit {
        EmitStage::Code => generated.render(&plan.entry),
        EmitStage::Context => match plan.context.to_json() {
            Ok(json) => json + "\n",
            Err(e) => {
                eprintln!("dlc: {}", dlc::diag::Diagnostic::from(&e));
                std::process::exit(1);
            }
        },
        EmitStage::Report => {
            let mut out = String::from("level\tcurrent\tpeak\n");
            for (level, current, peak) in plan.context.arena_usage() {
                out.push_str(&format!("{}\t{}\t{}\n", level, current, peak));
            }
            out
        }
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                eprintln!("dlc: error: {}: {}", path.display(), e);
                std::process::exit(2);
            }
        }
        None => print!("{}", text),
    }
}

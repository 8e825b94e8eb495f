mod cli;
mod core;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "credmeter", about = "Credit metering for AI agent marketplaces", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// User to act as (default: $CREDMETER_USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    format: Option<String>,

    /// Shorthand for --format json
    #[arg(short = 'j', long = "json", global = true)]
    json: bool,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,

    /// Disable ANSI colors
    #[arg(long, global = true)]
    no_color: bool,

    /// Verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the current credit balance
    Balance,
    /// Check whether the user can start a chat with an agent
    Check {
        /// Agent identifier
        agent: String,
    },
    /// Send one message to an agent, charging credits for it
    Chat {
        /// Agent identifier
        agent: String,
        /// Message text
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
    },
    /// List recent credit transactions
    History {
        /// Show at most this many entries
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Add credits through the ledger (purchases, admin grants)
    Grant {
        /// Number of credits
        amount: i64,
        /// Transaction type (topup|subscription|admin_grant|admin_revoke|referral_bonus|rollover|trial)
        #[arg(short = 't', long = "type", default_value = "topup")]
        kind: String,
        /// Description stored on the transaction
        #[arg(short, long)]
        description: Option<String>,
        /// Credit another user instead of --user
        #[arg(long = "to")]
        target: Option<String>,
    },
    /// Show the paywall decision for an agent on a route
    Gate {
        /// Agent identifier
        agent: String,
        /// Route the user is on
        #[arg(short, long, default_value = "/")]
        route: String,
        /// Show the paywall in place instead of redirecting
        #[arg(long)]
        allow_zero_credits: bool,
    },
    /// Show agent pricing
    Pricing {
        /// Resolve a single agent (default: list configured entries)
        agent: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Generate a starter config file
    Init,
    /// Validate config file
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    core::logging::init(cli.verbose);

    // Config problems surface in the command itself; here only display defaults matter.
    let settings = core::config::AppConfig::load()
        .map(|c| c.settings)
        .unwrap_or_default();
    let output_opts = cli::output::OutputOptions {
        format: if cli.json {
            cli::output::OutputFormat::Json
        } else {
            match cli.format.as_deref().unwrap_or(settings.default_format.as_str()) {
                "json" => cli::output::OutputFormat::Json,
                _ => cli::output::OutputFormat::Text,
            }
        },
        pretty: cli.pretty,
        use_color: match settings.color.as_str() {
            "never" => false,
            "always" => !cli.no_color,
            _ => cli::output::detect_color(!cli.no_color),
        },
        verbose: cli.verbose,
    };
    let user = cli.user.as_deref();

    match cli.command {
        Commands::Balance => cli::credits_cmd::balance(user, &output_opts).await?,
        Commands::Check { agent } => cli::agent_cmd::check(user, &agent, &output_opts).await?,
        Commands::Chat { agent, message } => {
            cli::agent_cmd::chat(user, &agent, &message.join(" "), &output_opts).await?
        }
        Commands::History { limit } => cli::credits_cmd::history(user, limit, &output_opts).await?,
        Commands::Grant {
            amount,
            kind,
            description,
            target,
        } => {
            cli::credits_cmd::grant(user, target, amount, &kind, description, &output_opts).await?
        }
        Commands::Gate {
            agent,
            route,
            allow_zero_credits,
        } => cli::agent_cmd::gate(user, &agent, &route, allow_zero_credits, &output_opts).await?,
        Commands::Pricing { agent } => cli::agent_cmd::pricing(agent.as_deref(), &output_opts).await?,
        Commands::Config { action } => match action {
            ConfigAction::Init => cli::config_cmd::init(&output_opts)?,
            ConfigAction::Check => cli::config_cmd::check(&output_opts)?,
        },
    }

    Ok(())
}

use clap::{Args, CommandFactory, Parser, Subcommand};
use replyflow::clock::{ts, Clock, SystemClock};
use replyflow::config::Config;
use replyflow::db::{Database, FollowupSettings};
use replyflow::settings::{RuntimeSettings, SETTING_KEYS};
use replyflow::{logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_ABOUT: &str = concat!(
    "\x1b[1mReplyFlow v",
    env!("CARGO_PKG_VERSION"),
    "\x1b[22m\n",
    "Automated WhatsApp replies, follow-ups and missed-message recovery.\n",
    "\n",
    "\x1b[1mQuick Start:\x1b[22m\n",
    "  1) create replyflow.config.yaml (or point REPLYFLOW_CONFIG at one)\n",
    "  2) replyflow followups show\n",
    "  3) replyflow start",
);

#[derive(Debug, Parser)]
#[command(name = "replyflow", version = VERSION, about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start runtime (webhook server, reply pipeline, background sweeps)
    Start,
    /// Inspect or change the follow-up settings
    Followups(FollowupsCommand),
    /// Inspect or override runtime settings
    Settings(SettingsCommand),
    /// Print the last lines of the log files
    Logs {
        #[arg(default_value_t = 100)]
        lines: usize,
    },
    /// Show version
    Version,
}

#[derive(Debug, Args)]
struct FollowupsCommand {
    #[command(subcommand)]
    action: Option<FollowupsAction>,
}

#[derive(Debug, Subcommand)]
enum FollowupsAction {
    /// Print the current settings
    Show,
    Enable,
    Disable,
    /// Change timing and rate limits
    Set(FollowupTiming),
}

#[derive(Debug, Default, Args)]
struct FollowupTiming {
    #[arg(long)]
    inactivity_hours: Option<f64>,
    #[arg(long)]
    delay_hours: Option<f64>,
    #[arg(long)]
    max_per_conversation: Option<i64>,
    #[arg(long)]
    interval_hours: Option<f64>,
}

#[derive(Debug, Args)]
struct SettingsCommand {
    #[command(subcommand)]
    action: Option<SettingsAction>,
}

#[derive(Debug, Subcommand)]
enum SettingsAction {
    /// Print one setting, or all of them
    Get { key: Option<String> },
    /// Override a setting; omit the value to restore the config default
    Set { key: String, value: Option<String> },
}

fn print_version() {
    println!("replyflow {VERSION}");
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    let runtime_dir = config.runtime_data_dir();
    Ok(Database::new(&runtime_dir.to_string_lossy())?)
}

fn apply_timing(settings: &mut FollowupSettings, timing: &FollowupTiming) -> anyhow::Result<()> {
    if let Some(h) = timing.inactivity_hours {
        if h <= 0.0 {
            anyhow::bail!("--inactivity-hours must be > 0");
        }
        settings.inactivity_hours = h;
    }
    if let Some(h) = timing.delay_hours {
        if h < 0.0 {
            anyhow::bail!("--delay-hours must be >= 0");
        }
        settings.delay_hours = h;
    }
    if let Some(n) = timing.max_per_conversation {
        if n < 1 {
            anyhow::bail!("--max-per-conversation must be >= 1");
        }
        settings.max_followups_per_conversation = n;
    }
    if let Some(h) = timing.interval_hours {
        if h <= 0.0 {
            anyhow::bail!("--interval-hours must be > 0");
        }
        settings.followup_interval_hours = h;
    }
    Ok(())
}

fn print_followup_settings(settings: &FollowupSettings) {
    println!("enabled:                 {}", settings.enabled);
    println!("inactivity_hours:        {}", settings.inactivity_hours);
    println!("delay_hours:             {}", settings.delay_hours);
    println!(
        "max_per_conversation:    {}",
        settings.max_followups_per_conversation
    );
    println!("interval_hours:          {}", settings.followup_interval_hours);
    println!("generate_criteria:       {}", settings.generate_criteria);
    println!("skip_criteria:           {}", settings.skip_criteria);
}

fn handle_followups_cli(action: Option<FollowupsAction>) -> anyhow::Result<()> {
    let Some(action) = action else {
        let mut cmd = Cli::command();
        if let Some(sub) = cmd.find_subcommand_mut("followups") {
            sub.print_help()?;
            println!();
        }
        return Ok(());
    };
    let config = Config::load()?;
    let db = open_database(&config)?;
    let now = ts(SystemClock.now());
    let mut settings = match db.get_followup_settings()? {
        Some(s) => s,
        None => config.followup_seed(),
    };
    match action {
        FollowupsAction::Show => {
            print_followup_settings(&settings);
            for (status, n) in db.followup_status_counts()? {
                println!("queue {status}: {n}");
            }
            return Ok(());
        }
        FollowupsAction::Enable => settings.enabled = true,
        FollowupsAction::Disable => settings.enabled = false,
        FollowupsAction::Set(timing) => apply_timing(&mut settings, &timing)?,
    }
    db.save_followup_settings(&settings, &now)?;
    println!("Follow-up settings saved.");
    print_followup_settings(&settings);
    Ok(())
}

fn handle_settings_cli(action: Option<SettingsAction>) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = open_database(&config)?;
    match action {
        None | Some(SettingsAction::Get { key: None }) => {
            let effective = RuntimeSettings::load(&config, &db)?;
            for key in SETTING_KEYS {
                println!("{key} = {}", effective.get(key).unwrap_or_default());
            }
        }
        Some(SettingsAction::Get { key: Some(key) }) => {
            let effective = RuntimeSettings::load(&config, &db)?;
            match effective.get(&key) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("unknown setting '{key}'"),
            }
        }
        Some(SettingsAction::Set { key, value: None }) => {
            if !SETTING_KEYS.contains(&key.as_str()) {
                anyhow::bail!("unknown setting '{key}'");
            }
            if db.delete_setting(&key)? {
                println!("{key} restored to the config default");
            } else {
                println!("{key} has no override");
            }
        }
        Some(SettingsAction::Set {
            key,
            value: Some(value),
        }) => {
            RuntimeSettings::validate(&config, &key, &value).map_err(|e| anyhow::anyhow!(e))?;
            db.set_setting(&key, &value, &ts(SystemClock.now()))?;
            println!("{key} = {value}");
        }
    }
    Ok(())
}

fn handle_logs_cli(lines: usize) -> anyhow::Result<()> {
    let config = Config::load()?;
    let dir = logging::log_dir(&config.runtime_data_dir());
    let tail = logging::read_last_lines_from_logs(&dir, lines)?;
    if tail.is_empty() {
        println!("No log lines under {}", dir.display());
    }
    for line in tail {
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(MainCommand::Start) => {}
        Some(MainCommand::Followups(cmd)) => return handle_followups_cli(cmd.action),
        Some(MainCommand::Settings(cmd)) => return handle_settings_cli(cmd.action),
        Some(MainCommand::Logs { lines }) => return handle_logs_cli(lines),
        Some(MainCommand::Version) => {
            print_version();
            return Ok(());
        }
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
            return Ok(());
        }
    }

    let config = Config::load()?;
    if std::env::var("REPLYFLOW_LOG_FILE").is_ok() {
        logging::init_logging(&config.runtime_data_dir(), config.log_retention_days)?;
    } else {
        logging::init_console_logging();
    }
    info!("Starting ReplyFlow {VERSION}...");

    runtime::run(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> FollowupSettings {
        FollowupSettings {
            enabled: true,
            generate_criteria: "cliente pediu orçamento".into(),
            skip_criteria: "cliente recusou".into(),
            inactivity_hours: 24.0,
            delay_hours: 2.0,
            max_followups_per_conversation: 1,
            followup_interval_hours: 24.0,
        }
    }

    #[test]
    fn test_apply_timing_updates_only_given_fields() {
        let mut settings = seed();
        let timing = FollowupTiming {
            delay_hours: Some(0.5),
            max_per_conversation: Some(3),
            ..FollowupTiming::default()
        };
        apply_timing(&mut settings, &timing).unwrap();
        assert_eq!(settings.delay_hours, 0.5);
        assert_eq!(settings.max_followups_per_conversation, 3);
        assert_eq!(settings.inactivity_hours, 24.0);
        assert_eq!(settings.followup_interval_hours, 24.0);
    }

    #[test]
    fn test_apply_timing_rejects_non_positive_values() {
        let mut settings = seed();
        let timing = FollowupTiming {
            inactivity_hours: Some(0.0),
            ..FollowupTiming::default()
        };
        assert!(apply_timing(&mut settings, &timing).is_err());
        let timing = FollowupTiming {
            max_per_conversation: Some(0),
            ..FollowupTiming::default()
        };
        assert!(apply_timing(&mut settings, &timing).is_err());
        assert_eq!(settings, seed());
    }

    #[test]
    fn test_cli_parses_followups_set() {
        let cli = Cli::try_parse_from([
            "replyflow",
            "followups",
            "set",
            "--inactivity-hours",
            "12",
            "--interval-hours",
            "48",
        ])
        .unwrap();
        let Some(MainCommand::Followups(FollowupsCommand {
            action: Some(FollowupsAction::Set(timing)),
        })) = cli.command
        else {
            panic!("expected followups set");
        };
        assert_eq!(timing.inactivity_hours, Some(12.0));
        assert_eq!(timing.interval_hours, Some(48.0));
        assert!(timing.delay_hours.is_none());
    }

    #[test]
    fn test_cli_parses_settings_and_logs() {
        let cli = Cli::try_parse_from(["replyflow", "settings", "set", "emoji_enabled", "false"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Some(MainCommand::Settings(SettingsCommand {
                action: Some(SettingsAction::Set { ref key, value: Some(ref v) })
            })) if key == "emoji_enabled" && v == "false"
        ));
        let cli = Cli::try_parse_from(["replyflow", "logs"]).unwrap();
        assert!(matches!(cli.command, Some(MainCommand::Logs { lines: 100 })));
    }
}

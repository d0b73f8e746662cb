use anyhow::{bail, Context, Result};
use ledgerguard::config::Config;
use ledgerguard::heartbeat::ControlPlane;
use ledgerguard::logging::{json_log, obj, v_str};
use ledgerguard::policy::RegressionDeltas;
use ledgerguard::risk::RiskTier;
use ledgerguard::store::SqliteStore;

const USAGE: &str = "usage:
  ledgerguard heartbeat <tenant> <month_key> [tier]
  ledgerguard approve <tenant> <proposal_id> <candidate> <baseline> <precision_delta> <recall_delta>
  ledgerguard replay-dlq <tenant> <quarantine_id> [max_attempts]";

fn main() {
    if let Err(e) = run() {
        json_log("fatal", obj(&[("msg", v_str(&format!("{:#}", e)))]));
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_env();
    let store = SqliteStore::open(&config.sqlite_path)
        .with_context(|| format!("opening store at {}", config.sqlite_path))?;
    let mut plane = ControlPlane::new(config, Box::new(store));

    match args.first().map(String::as_str) {
        Some("heartbeat") => {
            let tenant = arg(&args, 1, "tenant")?;
            let month_key = arg(&args, 2, "month_key")?;
            let tier = match args.get(3) {
                Some(raw) => RiskTier::parse(raw)
                    .with_context(|| format!("unknown risk tier {:?}", raw))?,
                None => RiskTier::Medium,
            };
            let report = plane.run_heartbeat(tenant, month_key, tier)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some("approve") => {
            let tenant = arg(&args, 1, "tenant")?;
            let proposal_id = arg(&args, 2, "proposal_id")?;
            let candidate = arg(&args, 3, "candidate")?;
            let baseline = arg(&args, 4, "baseline")?;
            let precision_delta: f64 = arg(&args, 5, "precision_delta")?
                .parse()
                .context("precision_delta must be a number")?;
            let recall_delta: f64 = arg(&args, 6, "recall_delta")?
                .parse()
                .context("recall_delta must be a number")?;
            let report = plane.approve_policy_proposal(
                tenant,
                proposal_id,
                candidate,
                baseline,
                RegressionDeltas { precision_delta, recall_delta },
                "operator",
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some("replay-dlq") => {
            let tenant = arg(&args, 1, "tenant")?;
            let quarantine_id = arg(&args, 2, "quarantine_id")?;
            let max_attempts = match args.get(3) {
                Some(raw) => Some(raw.parse().context("max_attempts must be an integer")?),
                None => None,
            };
            let report = plane.replay_dead_letter(tenant, quarantine_id, max_attempts)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => bail!("{}", USAGE),
    }
    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, name: &str) -> Result<&'a str> {
    match args.get(idx) {
        Some(v) => Ok(v.as_str()),
        None => bail!("missing argument <{}>\n{}", name, USAGE),
    }
}

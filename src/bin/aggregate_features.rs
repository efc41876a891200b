use powerflow::{
    init_logging, log_app_start, logging_config_from_env, run_aggregate_features, PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = PipelineConfig::from_env()?;
    log_app_start("aggregate_features", &logging_cfg, &cfg);

    let delta_hours = parse_delta_hours(std::env::args().skip(1))?.or(cfg.delta_hours);
    let report = run_aggregate_features(&cfg, delta_hours)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

const DELTA_FLAGS: [&str; 2] = ["--delta_hours", "--delta-hours"];

/// Accepts `--delta_hours N` or `--delta_hours=N`; the dashed spelling
/// works too.
fn parse_delta_hours(
    mut args: impl Iterator<Item = String>,
) -> Result<Option<u32>, Box<dyn std::error::Error>> {
    let mut delta_hours = None;
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };
        if !DELTA_FLAGS.contains(&flag.as_str()) {
            return Err(format!("unexpected argument '{arg}'").into());
        }
        let raw = match inline {
            Some(value) => value,
            None => args.next().ok_or_else(|| format!("{flag} needs a value"))?,
        };
        delta_hours = Some(
            raw.parse::<u32>()
                .map_err(|_| format!("{flag} must be a non-negative integer, got '{raw}'"))?,
        );
    }
    Ok(delta_hours)
}

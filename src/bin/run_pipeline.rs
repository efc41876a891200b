use powerflow::{
    init_logging, log_app_start, logging_config_from_env, run_all, PipelineConfig,
    SCHEDULED_DELTA_HOURS,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = PipelineConfig::from_env()?;
    log_app_start("run_pipeline", &logging_cfg, &cfg);

    let delta_hours = cfg.delta_hours.unwrap_or(SCHEDULED_DELTA_HOURS);
    let report = run_all(&cfg, Some(delta_hours))?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

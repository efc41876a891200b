use powerflow::{
    init_logging, log_app_start, logging_config_from_env, run_aggregate_to_power_consumption, PipelineConfig,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    let cfg = PipelineConfig::from_env()?;
    log_app_start("aggregate_to_power_consumption", &logging_cfg, &cfg);

    let report = run_aggregate_to_power_consumption(&cfg)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}

//! Human-readable error descriptions and structured JSON error formatting.

use growth_core::error::{BuildError, EstimationError};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingExperiment => {
                "What happened: No experiment was named.\nLikely causes: `experiment` is missing from the config.\nHow to fix: Set `experiment = \"...\"` in the TOML or pass --experiment.".to_string()
            }
            BuildError::MissingStore => {
                "What happened: No store was provided to the estimation job.\nLikely causes: The store directory could not be opened.\nHow to fix: Check [store] path in the config and its permissions.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun. See etc/growth_config.toml for a sample."
            ),
        };
    }

    if let Some(ee) = err.downcast_ref::<EstimationError>() {
        return match ee {
            EstimationError::MissingCalibration(exp) => format!(
                "What happened: No normalization baseline is cached for experiment {exp:?}.\nLikely causes: The experiment never ran live, or the store path points elsewhere.\nHow to fix: Run `growth live` once to bootstrap the baseline, or copy od_normalization_mean.json into [store] path."
            ),
            EstimationError::MixedSourceMode { od_live, events_live } => format!(
                "What happened: OD source (live={od_live}) and event source (live={events_live}) disagree.\nLikely causes: One recording was paired with a live feed.\nHow to fix: Use two recordings or two live feeds."
            ),
            EstimationError::NumericalInstability(msg) => format!(
                "What happened: The filter became numerically unstable ({msg}).\nLikely causes: A corrupt cached growth rate, or readings far outside the calibrated range.\nHow to fix: Inspect growth_rate.json in the store; re-run with --log-level=debug to see the last accepted batch."
            ),
            EstimationError::InvalidCovariance(msg) | EstimationError::Config(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML, or a baseline without the configured channels.\nHow to fix: Edit the config file, then rerun."
            ),
            _ => format!(
                "What happened: {ee}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    if let Some(te) = err.downcast_ref::<toml::de::Error>() {
        let at = te
            .span()
            .map(|r| format!(" at bytes {}..{}", r.start, r.end))
            .unwrap_or_default();
        return format!(
            "What happened: The config file is not valid ({}{at}).\nLikely causes: A typo, a value of the wrong type, or a missing `experiment`.\nHow to fix: Compare the file with etc/growth_config.toml.",
            te.message().trim_end()
        );
    }

    let msg = err
        .chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("csv must have headers") {
        return format!(
            "What happened: A recording has unexpected CSV headers.\nLikely causes: Wrong file passed to --readings or --events.\nHow to fix: {msg}"
        );
    }

    if lower.contains("failed to read config") {
        return format!(
            "What happened: {msg}.\nHow to fix: Pass --config with a readable TOML file."
        );
    }

    format!(
        "Something went wrong.\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes for the typed failures; everything else is 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<BuildError>().is_some()
        || err.downcast_ref::<toml::de::Error>().is_some()
    {
        return 5;
    }
    match err.downcast_ref::<EstimationError>() {
        Some(EstimationError::MissingCalibration(_)) => 2,
        Some(EstimationError::MixedSourceMode { .. }) => 3,
        Some(EstimationError::NumericalInstability(_)) => 4,
        Some(EstimationError::InvalidCovariance(_) | EstimationError::Config(_)) => 5,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if err.downcast_ref::<BuildError>().is_some()
        || err.downcast_ref::<toml::de::Error>().is_some()
    {
        return "InvalidConfig";
    }
    match err.downcast_ref::<EstimationError>() {
        Some(EstimationError::MissingCalibration(_)) => "MissingCalibration",
        Some(EstimationError::MixedSourceMode { .. }) => "MixedSourceMode",
        Some(EstimationError::NumericalInstability(_)) => "NumericalInstability",
        Some(EstimationError::InvalidCovariance(_) | EstimationError::Config(_)) => {
            "InvalidConfig"
        }
        _ => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    serde_json::json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    })
    .to_string()
}

use crate::error::StampedeError;
use crate::model::{
    LoadPhase, Scenario, Step, StepAction, TestConfiguration,
};

/// Validate a [`TestConfiguration`] and return a list of validation errors.
///
/// An empty `Vec` means the configuration is valid. Validation failures are
/// surfaced before execution and map to a non-zero exit code.
pub fn validate(config: &TestConfiguration) -> Vec<StampedeError> {
    let mut errors = Vec::new();

    if config.name.trim().is_empty() {
        errors.push(StampedeError::Validation(
            "test name must not be empty".to_string(),
        ));
    }

    if config.scenarios.is_empty() {
        errors.push(StampedeError::Validation(
            "configuration has no scenarios".to_string(),
        ));
    }

    for phase in config.load.phases() {
        errors.extend(validate_phase(&phase));
    }

    for scenario in &config.scenarios {
        errors.extend(validate_scenario(scenario));
    }

    if let Some(distributed) = &config.distributed {
        if distributed.workers.is_empty() {
            errors.push(StampedeError::Validation(
                "distributed configuration has no workers".to_string(),
            ));
        }
    }

    errors
}

fn validate_phase(phase: &LoadPhase) -> Vec<StampedeError> {
    let mut errors = Vec::new();

    match phase {
        LoadPhase::Basic {
            duration, ramp_up, ..
        } => {
            for (field, value) in [("duration", duration), ("ramp_up", ramp_up)] {
                if let Some(v) = value {
                    if let Err(e) = v.to_duration() {
                        errors.push(StampedeError::Validation(format!(
                            "basic phase {field}: {e}"
                        )));
                    }
                }
            }
        }
        LoadPhase::Stepping { steps } => {
            if steps.is_empty() {
                errors.push(StampedeError::Validation(
                    "stepping phase has no steps".to_string(),
                ));
            }
            for (i, step) in steps.iter().enumerate() {
                if let Err(e) = step.duration.to_duration() {
                    errors.push(StampedeError::Validation(format!(
                        "stepping phase step {i}: {e}"
                    )));
                }
            }
        }
        LoadPhase::Arrivals { rate, duration, .. } => {
            if *rate <= 0.0 || !rate.is_finite() {
                errors.push(StampedeError::Validation(format!(
                    "arrivals phase rate must be positive (got {rate})"
                )));
            }
            if let Err(e) = duration.to_duration() {
                errors.push(StampedeError::Validation(format!(
                    "arrivals phase duration: {e}"
                )));
            }
        }
    }

    errors
}

fn validate_scenario(scenario: &Scenario) -> Vec<StampedeError> {
    let mut errors = Vec::new();

    if scenario.name.trim().is_empty() {
        errors.push(StampedeError::Validation(
            "scenario name must not be empty".to_string(),
        ));
    }

    if scenario.steps.is_empty() {
        errors.push(StampedeError::Validation(format!(
            "scenario \"{}\" has no steps",
            scenario.name
        )));
    }

    for step in &scenario.steps {
        errors.extend(validate_step(&scenario.name, step));
    }

    errors
}

fn validate_step(scenario: &str, step: &Step) -> Vec<StampedeError> {
    let mut errors = Vec::new();

    if step.common.name.trim().is_empty() {
        errors.push(StampedeError::Validation(format!(
            "scenario \"{scenario}\" contains a step without a name"
        )));
    }

    match &step.action {
        StepAction::Rest { url, json, body, .. } => {
            if url.trim().is_empty() {
                errors.push(StampedeError::Validation(format!(
                    "step \"{}\": URL must not be empty",
                    step.common.name
                )));
            }
            if json.is_some() && body.is_some() {
                errors.push(StampedeError::Validation(format!(
                    "step \"{}\": json and body are mutually exclusive",
                    step.common.name
                )));
            }
        }
        StepAction::Soap { url, envelope, .. } => {
            if url.trim().is_empty() {
                errors.push(StampedeError::Validation(format!(
                    "step \"{}\": URL must not be empty",
                    step.common.name
                )));
            }
            if envelope.trim().is_empty() {
                errors.push(StampedeError::Validation(format!(
                    "step \"{}\": envelope must not be empty",
                    step.common.name
                )));
            }
        }
        StepAction::Rendezvous { count, .. } => {
            if *count == 0 {
                errors.push(StampedeError::Validation(format!(
                    "step \"{}\": rendezvous count must be at least 1",
                    step.common.name
                )));
            }
        }
        StepAction::Wait { duration } => {
            // Templated wait durations are resolved at run time.
            if let crate::model::DurationValue::Text(text) = duration {
                if !text.contains("{{") {
                    if let Err(e) = duration.to_duration() {
                        errors.push(StampedeError::Validation(format!(
                            "step \"{}\": {e}",
                            step.common.name
                        )));
                    }
                }
            }
        }
        _ => {}
    }

    errors
}

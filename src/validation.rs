//! Schema checkpoints.
//!
//! A job's params and result "schemas" are its serde types. Validation runs
//! at exactly three points per execution: before the first persistence of
//! params, after loading params back out of storage, and before persisting a
//! result. Each failure names the owning job and carries serde's field
//! path/position message.

use serde_json::Value;

use crate::errors::Error;
use crate::job::Job;

/// Checkpoint: params immediately before their first persistence.
pub(crate) fn params_value<J: Job>(job: &J) -> Result<Value, Error> {
    serde_json::to_value(job).map_err(|err| Error::validation(J::JOB_NAME, err))
}

/// Checkpoint: params immediately after being read back out of storage.
///
/// Defends against stored data drifting from the current schema version.
pub(crate) fn parse_params<J: Job>(params: Value) -> Result<J, Error> {
    serde_json::from_value(params).map_err(|err| Error::validation(J::JOB_NAME, err))
}

/// Checkpoint: result immediately before persistence.
pub(crate) fn result_value<J: Job>(output: &J::Output) -> Result<Value, Error> {
    serde_json::to_value(output).map_err(|err| Error::validation(J::JOB_NAME, err))
}

/// Parse-only check used by the cron scheduler to validate stored default
/// params against the registered job before enqueueing.
pub(crate) fn check_params<J: Job>(params: &Value) -> Result<(), Error> {
    parse_params::<J>(params.clone()).map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Execution;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    impl Job for Sample {
        const JOB_NAME: &'static str = "sample";
        type Context = ();
        type Output = ();

        async fn run(&self, _ctx: (), _exec: &Execution) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn parse_rejects_wrong_shape_and_names_the_job() {
        let err = parse_params::<Sample>(json!({"name": "x"})).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("sample"), "missing job name: {message}");
        assert!(message.contains("count"), "missing field name: {message}");

        claims::assert_err!(parse_params::<Sample>(json!({
            "name": "x",
            "count": "many",
        })));
    }

    #[test]
    fn round_trip_preserves_params() {
        let value = params_value(&Sample {
            name: "x".into(),
            count: 3,
        })
        .unwrap();
        let parsed = parse_params::<Sample>(value).unwrap();
        assert_eq!(parsed.name, "x");
        assert_eq!(parsed.count, 3);
    }

    #[test]
    fn check_params_accepts_valid_defaults() {
        claims::assert_ok!(check_params::<Sample>(&json!({"name": "x", "count": 1})));
        claims::assert_err!(check_params::<Sample>(&json!({"count": 1})));
    }
}

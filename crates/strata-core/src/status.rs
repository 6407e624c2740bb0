use serde::{Deserialize, Serialize};

/// Generic health report for a source or sink connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub working: bool,
    #[serde(default)]
    pub problems: Vec<String>,
}

impl Status {
    /// Working with no known problems.
    pub fn healthy() -> Self {
        Self {
            working: true,
            problems: Vec::new(),
        }
    }

    /// Still working, but with a problem worth reporting.
    pub fn degraded(problem: impl Into<String>) -> Self {
        Self {
            working: true,
            problems: vec![problem.into()],
        }
    }

    /// Not working.
    pub fn failed(problem: impl Into<String>) -> Self {
        Self {
            working: false,
            problems: vec![problem.into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Status;

    #[test]
    fn constructors_set_working_flag() {
        assert_eq!(
            Status::healthy(),
            Status {
                working: true,
                problems: vec![]
            }
        );
        assert!(Status::degraded("connecting").working);
        assert!(!Status::failed("connection shutdown").working);
    }

    #[test]
    fn serializes_with_problem_list() {
        let json = serde_json::to_string(&Status::degraded("transient failure"))
            .expect("status should serialize");
        assert_eq!(json, r#"{"working":true,"problems":["transient failure"]}"#);

        let parsed: Status =
            serde_json::from_str(r#"{"working":true}"#).expect("problems default to empty");
        assert_eq!(parsed, Status::healthy());
    }
}

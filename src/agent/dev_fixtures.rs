use crate::Fixture;

/// Exits 0, 1 or 2 at random, so the fixtures keep flipping between
/// passing, warning and critical
const FLAPPING_SCRIPT: &str = "exit $(shuf -i 0-2 -n 1)";

/// Demo registrations for trying the agent against a local dev registry
pub fn dev_fixtures() -> Vec<Fixture> {
    vec![
        Fixture::Check {
            name: "memory usage".to_string(),
            script: FLAPPING_SCRIPT.to_string(),
            interval: "20s".to_string(),
        },
        Fixture::Service {
            name: "redis".to_string(),
            tags: vec!["alpha".to_string(), "beta".to_string()],
            port: 2000,
            script: FLAPPING_SCRIPT.to_string(),
            interval: "10s".to_string(),
        },
        Fixture::Service {
            name: "nginx".to_string(),
            tags: vec!["gamma".to_string(), "delta".to_string()],
            port: 3000,
            script: FLAPPING_SCRIPT.to_string(),
            interval: "8s".to_string(),
        },
    ]
}

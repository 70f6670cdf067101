use ulid::Ulid;

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter().map(Ulid::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Missing or malformed input; never retried.
    Validation(String),
    NotFound(Ulid),
    /// The request's company does not own this engine.
    OutOfScope(String),
    AlreadyExists(Ulid),
    SelfDependency(Ulid),
    DuplicateDependency {
        existing: Ulid,
    },
    /// Adding `predecessor → successor` would close a directed cycle.
    CycleDetected {
        predecessor: Ulid,
        successor: Ulid,
    },
    SiblingOrderTaken {
        sort_order: i32,
        existing: Ulid,
    },
    BlackoutOverlap {
        resource_id: Ulid,
        blackouts: Vec<Ulid>,
    },
    CapacityExceeded {
        resource_id: Ulid,
        capacity: f64,
        peak: f64,
        colliding: Vec<Ulid>,
    },
    /// Critical path pass hit an inconsistent graph. A bug signal.
    Computation(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable error class reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) | EngineError::OutOfScope(_) => "not_found",
            EngineError::AlreadyExists(_)
            | EngineError::SelfDependency(_)
            | EngineError::DuplicateDependency { .. }
            | EngineError::CycleDetected { .. }
            | EngineError::SiblingOrderTaken { .. }
            | EngineError::BlackoutOverlap { .. }
            | EngineError::CapacityExceeded { .. } => "conflict",
            EngineError::Computation(_) => "computation",
            EngineError::LimitExceeded(_) => "limit",
            EngineError::WalError(_) => "storage",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation error: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::OutOfScope(company) => write!(f, "not found in company {company}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SelfDependency(id) => {
                write!(f, "conflict: item {id} cannot depend on itself")
            }
            EngineError::DuplicateDependency { existing } => {
                write!(f, "conflict: duplicate dependency, existing edge {existing}")
            }
            EngineError::CycleDetected {
                predecessor,
                successor,
            } => write!(
                f,
                "conflict: dependency {predecessor} -> {successor} would create a cycle"
            ),
            EngineError::SiblingOrderTaken {
                sort_order,
                existing,
            } => write!(
                f,
                "conflict: sort order {sort_order} already used by sibling {existing}"
            ),
            EngineError::BlackoutOverlap {
                resource_id,
                blackouts,
            } => write!(
                f,
                "conflict: resource {resource_id} unavailable; overlapping blackouts: [{}]",
                join_ids(blackouts)
            ),
            EngineError::CapacityExceeded {
                resource_id,
                capacity,
                peak,
                colliding,
            } => write!(
                f,
                "conflict: resource {resource_id} capacity {capacity} exceeded (peak {peak}); colliding allocations: [{}]",
                join_ids(colliding)
            ),
            EngineError::Computation(msg) => write!(f, "internal computation error: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::Validation("x".into()).kind(), "validation");
        assert_eq!(EngineError::NotFound(Ulid::new()).kind(), "not_found");
        assert_eq!(EngineError::OutOfScope("acme".into()).kind(), "not_found");
        assert_eq!(
            EngineError::CycleDetected {
                predecessor: Ulid::new(),
                successor: Ulid::new()
            }
            .kind(),
            "conflict"
        );
        assert_eq!(EngineError::Computation("x".into()).kind(), "computation");
        assert_eq!(EngineError::WalError("x".into()).kind(), "storage");
    }

    #[test]
    fn capacity_message_lists_colliding_ids() {
        let a = Ulid::new();
        let b = Ulid::new();
        let err = EngineError::CapacityExceeded {
            resource_id: Ulid::new(),
            capacity: 100.0,
            peak: 110.0,
            colliding: vec![a, b],
        };
        let msg = err.to_string();
        assert!(msg.contains(&a.to_string()));
        assert!(msg.contains(&b.to_string()));
        assert!(msg.contains("peak 110"));
    }
}

use crate::error::{TreError, ValidationIssue};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// TestType
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TestType {
    Manual,
    Generic,
    Cucumber,
}

impl TestType {
    pub fn as_str(self) -> &'static str {
        match self {
            TestType::Manual => "Manual",
            TestType::Generic => "Generic",
            TestType::Cucumber => "Cucumber",
        }
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TestType {
    type Err = TreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(TestType::Manual),
            "generic" => Ok(TestType::Generic),
            "cucumber" => Ok(TestType::Cucumber),
            _ => Err(TreError::Validation(vec![ValidationIssue {
                external_id: String::new(),
                message: format!("unknown test type '{s}'"),
            }])),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "Critical",
            Priority::High => "High",
            Priority::Medium => "Medium",
            Priority::Low => "Low",
        }
    }

    /// Case-insensitive match against the four allowed names.
    pub fn parse(s: &str) -> Option<Priority> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Some(Priority::Critical),
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Plan phases. Execution order is the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Folders,
    Preconditions,
    TestCreation,
    TestFields,
    Links,
    Closure,
}

impl Phase {
    pub fn all() -> &'static [Phase] {
        &[
            Phase::Folders,
            Phase::Preconditions,
            Phase::TestCreation,
            Phase::TestFields,
            Phase::Links,
            Phase::Closure,
        ]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Folders => "folders",
            Phase::Preconditions => "preconditions",
            Phase::TestCreation => "test_creation",
            Phase::TestFields => "test_fields",
            Phase::Links => "links",
            Phase::Closure => "closure",
        }
    }

    /// Short label (`p1`..`p6`) used in operation ids.
    pub fn code(self) -> &'static str {
        match self {
            Phase::Folders => "p1",
            Phase::Preconditions => "p2",
            Phase::TestCreation => "p3",
            Phase::TestFields => "p4",
            Phase::Links => "p5",
            Phase::Closure => "p6",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OpKind
// ---------------------------------------------------------------------------

/// Operation kinds, declared in the tie-break order used inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    CreateFolder,
    CreatePrecondition,
    CreateTest,
    UpdateLabels,
    UpdatePriority,
    SetSteps,
    MoveTestToFolder,
    AddPreconditionLink,
    RemovePreconditionLink,
    TransitionIssue,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::CreateFolder => "create_folder",
            OpKind::CreatePrecondition => "create_precondition",
            OpKind::CreateTest => "create_test",
            OpKind::UpdateLabels => "update_labels",
            OpKind::UpdatePriority => "update_priority",
            OpKind::SetSteps => "set_steps",
            OpKind::MoveTestToFolder => "move_test_to_folder",
            OpKind::AddPreconditionLink => "add_precondition_link",
            OpKind::RemovePreconditionLink => "remove_precondition_link",
            OpKind::TransitionIssue => "transition_issue",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse("HIGH"), Some(Priority::High));
        assert_eq!(Priority::parse(" medium "), Some(Priority::Medium));
        assert_eq!(Priority::parse("Blocker"), None);
    }

    #[test]
    fn test_type_from_str() {
        assert_eq!("manual".parse::<TestType>().unwrap(), TestType::Manual);
        assert_eq!("Cucumber".parse::<TestType>().unwrap(), TestType::Cucumber);
        assert!("exploratory".parse::<TestType>().is_err());
    }

    #[test]
    fn phases_are_ordered() {
        let all = Phase::all();
        assert!(all.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(Phase::Links.code(), "p5");
        assert_eq!(Phase::TestCreation.index(), 2);
    }

    #[test]
    fn op_kind_order_places_create_before_steps_before_move() {
        assert!(OpKind::CreateTest < OpKind::SetSteps);
        assert!(OpKind::SetSteps < OpKind::MoveTestToFolder);
        assert_eq!(OpKind::MoveTestToFolder.to_string(), "move_test_to_folder");
    }
}

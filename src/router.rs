//! Question classification: which expert profile answers, and whether the
//! turn needs document retrieval at all.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::VehicleProfile;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExpertKind {
    Maintenance,
    Technical,
    Safety,
    General,
}

impl ExpertKind {
    pub const ALL: [ExpertKind; 4] = [
        ExpertKind::Maintenance,
        ExpertKind::Technical,
        ExpertKind::Safety,
        ExpertKind::General,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExpertKind::Maintenance => "maintenance",
            ExpertKind::Technical => "technical",
            ExpertKind::Safety => "safety",
            ExpertKind::General => "general",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        ExpertKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
    }

    pub fn profile(self) -> &'static ExpertProfile {
        match self {
            ExpertKind::Maintenance => &PROFILES[0],
            ExpertKind::Technical => &PROFILES[1],
            ExpertKind::Safety => &PROFILES[2],
            ExpertKind::General => &PROFILES[3],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Conversational,
    VehicleGeneral,
    VehicleTechnical,
}

impl QueryIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryIntent::Conversational => "conversational",
            QueryIntent::VehicleGeneral => "vehicle_general",
            QueryIntent::VehicleTechnical => "vehicle_technical",
        }
    }

    pub fn needs_retrieval(self) -> bool {
        matches!(self, QueryIntent::VehicleTechnical)
    }
}

#[derive(Debug)]
pub struct ExpertProfile {
    pub kind: ExpertKind,
    pub name: &'static str,
    pub description: &'static str,
    pub keywords: &'static [&'static str],
    instructions: &'static str,
    fallback: &'static str,
}

impl ExpertProfile {
    /// System instructions with the vehicle description filled in.
    pub fn system_prompt(&self, vehicle: &VehicleProfile) -> String {
        let vehicle_line = format!(
            "{} {} {} {}",
            vehicle.year, vehicle.make, vehicle.model, vehicle.trim
        );
        let mut prompt = self.instructions.replace("{vehicle}", vehicle_line.trim());
        if self.kind == ExpertKind::General && !vehicle.vin.is_empty() {
            prompt.push_str(&format!("\nVIN: {}", vehicle.vin));
        }
        prompt
    }

    /// Guidance appended when retrieval produced no passages.
    pub fn fallback(&self) -> &'static str {
        self.fallback
    }

    fn keyword_hits(&self, lower: &str) -> usize {
        self.keywords.iter().filter(|kw| lower.contains(*kw)).count()
    }
}

static PROFILES: [ExpertProfile; 4] = [
    ExpertProfile {
        kind: ExpertKind::Maintenance,
        name: "Maintenance Expert",
        description: "Service intervals, fluid specifications, filters and routine maintenance",
        keywords: &[
            "oil", "filter", "change", "service", "maintenance", "schedule", "interval",
            "fluid", "replace", "tire", "rotation", "brake pad", "transmission fluid",
            "coolant", "spark plug", "battery", "wiper",
        ],
        instructions: "You are the maintenance expert for a {vehicle}.\n\
            Focus on:\n\
            - Service intervals and schedules\n\
            - Fluid capacities and specifications\n\
            - Filter replacements\n\
            - Routine maintenance procedures\n\
            Be practical and include mileage-based recommendations.",
        fallback: "The documentation does not cover this. Give general maintenance guidance \
            and recommend checking the owner's manual maintenance schedule or a dealer.",
    },
    ExpertProfile {
        kind: ExpertKind::Technical,
        name: "Technical Expert",
        description: "Engine and drivetrain specs, towing capacity, electrical systems and troubleshooting",
        keywords: &[
            "spec", "capacity", "towing", "payload", "engine", "horsepower", "torque",
            "mpg", "fuel", "transmission", "4wd", "awd", "differential", "suspension",
            "electrical", "fuse", "relay", "sensor", "diagnostic",
        ],
        instructions: "You are the technical expert for a {vehicle}.\n\
            Focus on:\n\
            - Engine and drivetrain specifications\n\
            - Electrical systems and components\n\
            - Towing capacity and payload\n\
            - Technical troubleshooting\n\
            Provide precise technical details and specifications.",
        fallback: "The documentation does not cover this. Say so plainly and avoid quoting \
            specifications you cannot support.",
    },
    ExpertProfile {
        kind: ExpertKind::Safety,
        name: "Safety Expert",
        description: "Safety features, warning lights, recalls and emergency procedures",
        keywords: &[
            "safety", "warning", "airbag", "brake", "abs", "traction", "stability",
            "recall", "emergency", "child seat", "seatbelt", "crash", "accident",
            "hazard", "danger", "caution",
        ],
        instructions: "You are the safety expert for a {vehicle}.\n\
            Focus on:\n\
            - Safety features and systems\n\
            - Warning lights and indicators\n\
            - Emergency procedures\n\
            - Recall information\n\
            Prioritize safety above all else. Be clear and direct about safety concerns.",
        fallback: "The documentation does not cover this. Advise the driver to stop safely \
            and contact a dealer or roadside assistance if a warning is active.",
    },
    ExpertProfile {
        kind: ExpertKind::General,
        name: "General Assistant",
        description: "General vehicle questions and information",
        keywords: &[],
        instructions: "You are an assistant for the owner of a {vehicle}.\n\
            Answer questions about the vehicle based on the provided documentation.\n\
            Be concise, practical, and helpful.",
        fallback: "If you do not have documentation for this question, give general guidance \
            and suggest consulting the owner's manual or a dealer.",
    },
];

/// Seam for swapping the keyword rules for a learned classifier.
pub trait ExpertRouter: Send + Sync {
    fn classify(&self, question: &str) -> &'static ExpertProfile;

    fn intent(&self, question: &str) -> QueryIntent;
}

const VEHICLE_KEYWORDS: &[&str] = &[
    "oil", "filter", "change", "service", "maintenance", "schedule", "interval", "fluid",
    "replace", "tire", "rotation", "brake", "transmission", "coolant", "spark plug",
    "battery", "wiper", "alignment", "tune-up", "spec", "capacity", "towing", "payload",
    "engine", "horsepower", "torque", "mpg", "fuel", "4wd", "awd", "differential",
    "suspension", "electrical", "fuse", "relay", "sensor", "diagnostic", "warning light",
    "dashboard", "airbag", "abs", "traction", "stability", "recall", "emergency",
    "seatbelt", "child seat", "hazard", "bluetooth", "navigation", "cruise control",
    "climate", "air conditioning", "heater", "radio", "speaker", "camera", "parking",
    "mirror", "seat", "window", "door", "lock", "key", "remote", "start", "manual",
    "owner", "guide", "how to", "how do i", "where is", "what is", "reset", "turn on",
    "turn off", "activate", "deactivate",
];

const QUESTION_STARTERS: &[&str] = &[
    "how", "what", "where", "when", "why", "can i", "should i", "do i",
];

/// Deterministic keyword router. Ties favour safety, then maintenance; no
/// match lands on the general profile.
pub struct KeywordRouter {
    conversational: Vec<Regex>,
    vehicle_general: Vec<Regex>,
}

impl KeywordRouter {
    pub fn new() -> Self {
        let compile = |patterns: &[&str]| -> Vec<Regex> {
            patterns
                .iter()
                .filter_map(|pattern| Regex::new(pattern).ok())
                .collect()
        };

        Self {
            conversational: compile(&[
                r"^(hi|hello|hey|greetings|good morning|good afternoon|good evening)\b",
                r"^(thanks|thank you|thx|ty)\b",
                r"^(bye|goodbye|see you|later)\b",
                r"^(how are you|what's up|sup)\b",
                r"^(who are you|what are you|tell me about yourself)\b",
            ]),
            vehicle_general: compile(&[
                r"what (color|colour) is my",
                r"what year is my",
                r"what model is my",
                r"what is my vin",
                r"tell me about my (car|vehicle|truck|suv)",
            ]),
        }
    }
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpertRouter for KeywordRouter {
    fn classify(&self, question: &str) -> &'static ExpertProfile {
        let lower = question.to_ascii_lowercase();
        let safety = ExpertKind::Safety.profile().keyword_hits(&lower);
        let maintenance = ExpertKind::Maintenance.profile().keyword_hits(&lower);
        let technical = ExpertKind::Technical.profile().keyword_hits(&lower);

        let kind = if safety > 0 && safety >= maintenance.max(technical) {
            ExpertKind::Safety
        } else if maintenance > 0 && maintenance >= technical {
            ExpertKind::Maintenance
        } else if technical > 0 {
            ExpertKind::Technical
        } else {
            ExpertKind::General
        };

        tracing::info!(
            expert = kind.as_str(),
            safety,
            maintenance,
            technical,
            "routed question to expert"
        );
        kind.profile()
    }

    fn intent(&self, question: &str) -> QueryIntent {
        let lower = question.trim().to_ascii_lowercase();

        if self.conversational.iter().any(|re| re.is_match(&lower)) {
            return QueryIntent::Conversational;
        }
        if self.vehicle_general.iter().any(|re| re.is_match(&lower)) {
            return QueryIntent::VehicleGeneral;
        }
        if VEHICLE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return QueryIntent::VehicleTechnical;
        }
        if QUESTION_STARTERS.iter().any(|qs| lower.starts_with(qs)) {
            return QueryIntent::VehicleTechnical;
        }
        if lower.split_whitespace().count() <= 3 {
            return QueryIntent::Conversational;
        }
        QueryIntent::VehicleTechnical
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vehicle() -> VehicleProfile {
        VehicleProfile {
            year: "2018".to_string(),
            make: "Toyota".to_string(),
            model: "4Runner".to_string(),
            trim: "SR5".to_string(),
            vin: "JTEBU5JR0J5000000".to_string(),
        }
    }

    #[test]
    fn classifies_each_domain() {
        let router = KeywordRouter::new();
        assert_eq!(
            router.classify("When should I change the oil filter?").kind,
            ExpertKind::Maintenance
        );
        assert_eq!(
            router.classify("What is the towing capacity with the V6 engine?").kind,
            ExpertKind::Technical
        );
        assert_eq!(
            router.classify("The airbag warning light is on").kind,
            ExpertKind::Safety
        );
        assert_eq!(
            router.classify("Who designed the logo?").kind,
            ExpertKind::General
        );
    }

    #[test]
    fn safety_wins_ties_and_maintenance_beats_technical_on_ties() {
        let router = KeywordRouter::new();
        // "brake" (safety) vs "fluid" (maintenance): one hit each.
        assert_eq!(router.classify("brake fluid").kind, ExpertKind::Safety);
        // "fuel" (technical) vs "filter" (maintenance): one hit each.
        assert_eq!(router.classify("fuel filter").kind, ExpertKind::Maintenance);
    }

    #[test]
    fn classification_is_deterministic() {
        let router = KeywordRouter::new();
        let question = "How often should I rotate the tires and check tire pressure?";
        let first = router.classify(question).kind;
        for _ in 0..10 {
            assert_eq!(router.classify(question).kind, first);
        }
    }

    #[test]
    fn intent_separates_chitchat_from_manual_questions() {
        let router = KeywordRouter::new();
        assert_eq!(router.intent("hello there"), QueryIntent::Conversational);
        assert_eq!(router.intent("thanks!"), QueryIntent::Conversational);
        assert_eq!(router.intent("what is my VIN"), QueryIntent::VehicleGeneral);
        assert_eq!(
            router.intent("How do I reset the maintenance light?"),
            QueryIntent::VehicleTechnical
        );
        assert_eq!(router.intent("nice weather"), QueryIntent::Conversational);
        assert!(!QueryIntent::Conversational.needs_retrieval());
    }

    #[test]
    fn system_prompt_fills_vehicle_and_vin_only_for_general() {
        let general = ExpertKind::General.profile().system_prompt(&vehicle());
        assert!(general.contains("2018 Toyota 4Runner SR5"));
        assert!(general.contains("VIN: JTEBU5JR0J5000000"));

        let safety = ExpertKind::Safety.profile().system_prompt(&vehicle());
        assert!(safety.contains("safety expert"));
        assert!(!safety.contains("VIN"));
        assert!(!safety.contains("{vehicle}"));
    }

    #[test]
    fn expert_kind_round_trips_through_db_labels() {
        for kind in ExpertKind::ALL {
            assert_eq!(ExpertKind::from_db(kind.as_str()), Some(kind));
            assert_eq!(kind.profile().kind, kind);
        }
        assert_eq!(ExpertKind::from_db("astrology"), None);
    }
}

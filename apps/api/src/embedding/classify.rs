//! Lightweight content-type tagging and importance scoring for chunks.
//!
//! Both are pattern-matching heuristics: no model call, fully deterministic.

use crate::models::chunk::ContentType;

/// Technology and discipline terms that mark a span as skill content.
const SKILL_LEXICON: &[&str] = &[
    "python", "go", "golang", "rust", "java", "javascript", "typescript", "c++", "c#", "ruby",
    "kotlin", "swift", "scala", "sql", "postgresql", "postgres", "mysql", "redis", "mongodb",
    "kafka", "docker", "kubernetes", "terraform", "aws", "gcp", "azure", "linux", "react",
    "vue", "angular", "node", "django", "flask", "spark", "hadoop", "graphql", "grpc", "git",
    "tensorflow", "pytorch", "pandas", "html", "css", "figma", "excel", "tableau", "agile",
    "scrum", "ci/cd", "machine", "learning", "analytics", "devops", "microservices",
];

const ACTION_VERBS: &[&str] = &[
    "led", "built", "designed", "launched", "shipped", "reduced", "increased", "improved",
    "delivered", "managed", "architected", "created", "developed", "grew", "saved", "migrated",
    "automated", "founded", "won", "scaled", "owned", "mentored",
];

const TITLE_WORDS: &[&str] = &[
    "engineer", "developer", "manager", "director", "lead", "architect", "analyst", "designer",
    "consultant", "intern", "scientist", "officer", "head", "vp", "president", "founder",
    "specialist", "administrator", "coordinator", "principal", "staff", "senior",
];

const ORG_MARKERS: &[&str] = &[
    "inc", "inc.", "llc", "ltd", "corp", "corp.", "corporation", "company", "gmbh",
    "university", "college", "institute", "labs", "technologies", "group", "foundation",
];

/// Keyword density at which the density factor saturates.
const DENSITY_SATURATION: f32 = 0.25;

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || matches!(c, ',' | ';' | '(' | ')' | '|' | '•'))
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric() && c != '+' && c != '#' && c != '/')
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

fn count_hits(words: &[String], lexicon: &[&str]) -> usize {
    words.iter().filter(|w| lexicon.contains(&w.as_str())).count()
}

fn has_year(words: &[String]) -> bool {
    words.iter().any(|w| {
        w == "present"
            || w == "current"
            || (w.len() == 4
                && (w.starts_with("19") || w.starts_with("20"))
                && w.chars().all(|c| c.is_ascii_digit()))
    })
}

fn has_metric(text: &str) -> bool {
    text.contains('%') || text.contains('$') || text.chars().any(|c| c.is_ascii_digit())
}

fn section_is(label: &str, needles: &[&str]) -> bool {
    let label = label.to_lowercase();
    needles.iter().any(|n| label.contains(n))
}

/// Relative weight of a section when scoring importance.
pub fn section_weight(label: &str) -> f32 {
    if section_is(label, &["experience", "employment", "work history"]) {
        1.0
    } else if section_is(label, &["skill", "technolog", "competenc"]) {
        0.9
    } else if section_is(label, &["achievement", "award", "accomplishment"]) {
        0.85
    } else if section_is(label, &["summary", "profile", "about", "project"]) {
        0.8
    } else if section_is(label, &["education", "certification"]) {
        0.7
    } else {
        0.5
    }
}

/// Tags a chunk by what it mostly talks about.
pub fn classify(section_label: &str, text: &str) -> ContentType {
    let words = words(text);
    if words.is_empty() {
        return ContentType::FreeText;
    }
    let skill_hits = count_hits(&words, SKILL_LEXICON);
    let title_hits = count_hits(&words, TITLE_WORDS);
    let verb_hits = count_hits(&words, ACTION_VERBS);

    if section_is(section_label, &["skill", "technolog", "competenc"])
        || skill_hits as f32 / words.len() as f32 >= 0.3
    {
        return ContentType::Skill;
    }
    if has_year(&words) && title_hits > 0 {
        return ContentType::Achievement;
    }
    if section_is(section_label, &["achievement", "award"])
        || (has_metric(text) && verb_hits > 0)
    {
        return ContentType::Achievement;
    }
    if count_hits(&words, ORG_MARKERS) > 0 {
        return ContentType::Organization;
    }
    if title_hits > 0 && words.len() <= 12 {
        return ContentType::Title;
    }
    ContentType::FreeText
}

/// Importance in [0, 1]: section weight scaled by keyword density.
pub fn importance(section_label: &str, text: &str) -> f32 {
    let words = words(text);
    if words.is_empty() {
        return 0.0;
    }
    let signal = count_hits(&words, SKILL_LEXICON)
        + count_hits(&words, ACTION_VERBS)
        + words
            .iter()
            .filter(|w| w.chars().any(|c| c.is_ascii_digit()))
            .count();
    let density = signal as f32 / words.len() as f32;
    let factor = 0.4 + 0.6 * (density / DENSITY_SATURATION).min(1.0);
    (section_weight(section_label) * factor).clamp(0.0, 1.0)
}

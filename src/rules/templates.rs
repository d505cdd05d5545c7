//! Template selection for template-category rules.

use std::cmp::Ordering;

use crate::model::{Template, normalize_body};

/// Fraction of the template's keywords found in the normalized body.
/// Templates without keywords score zero.
pub fn score_template(template: &Template, normalized_body: &str) -> f32 {
    let keywords: Vec<String> = template
        .keywords
        .iter()
        .map(|k| normalize_body(k))
        .filter(|k| !k.is_empty())
        .collect();
    if keywords.is_empty() {
        return 0.0;
    }
    let hits = keywords.iter().filter(|k| normalized_body.contains(k.as_str())).count();
    hits as f32 / keywords.len() as f32
}

/// Best active template scoring at least `min_confidence`.
///
/// Ties on score go to the higher template priority, then the lower id,
/// so the choice never depends on store ordering.
pub fn select_template<'a>(
    templates: &'a [Template],
    normalized_body: &str,
    min_confidence: f32,
) -> Option<(&'a Template, f32)> {
    templates
        .iter()
        .filter(|t| t.is_active)
        .map(|t| (t, score_template(t, normalized_body)))
        .filter(|(_, score)| *score >= min_confidence)
        .min_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| a.id.cmp(&b.id))
        })
}

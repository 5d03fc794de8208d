//! Path-template matching for resource URIs.
//!
//! Templates use `:name` placeholders (e.g. `/device/:id/rssi`). Matching is
//! anchored and segment-based: a placeholder captures exactly one path
//! segment and never crosses a `/`. Everything else in the template is
//! literal.

use indexmap::IndexMap;

/// Match `path` against `template`, extracting `:name` placeholders.
///
/// Returns a map of placeholder name → captured segment, in template
/// declaration order, or `None` if the path does not match (wrong segment
/// count, literal mismatch, empty segment for a placeholder, or a duplicate
/// placeholder name in the template).
pub fn extract_pattern(template: &str, path: &str) -> Option<IndexMap<String, String>> {
    let tmpl_segments: Vec<&str> = template.split('/').collect();
    let path_segments: Vec<&str> = path.split('/').collect();

    if tmpl_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = IndexMap::new();
    for (tmpl, seg) in tmpl_segments.iter().zip(&path_segments) {
        match placeholder_name(tmpl) {
            Some(name) => {
                if seg.is_empty() {
                    return None;
                }
                // Duplicate placeholder names are ambiguous; fail the match.
                if params.insert(name.to_string(), seg.to_string()).is_some() {
                    return None;
                }
            }
            None => {
                if tmpl != seg {
                    return None;
                }
            }
        }
    }

    Some(params)
}

/// Returns the placeholder name if `segment` is `:name` with an alphanumeric
/// name, otherwise `None` (the segment is a literal).
fn placeholder_name(segment: &str) -> Option<&str> {
    let name = segment.strip_prefix(':')?;
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(name)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_placeholder() {
        let params = extract_pattern("/device/:id", "/device/7").unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params["id"], "7");
    }

    #[test]
    fn extracts_placeholder_between_literals() {
        let params = extract_pattern("/device/:id/rssi", "/device/42/rssi").unwrap();
        assert_eq!(params["id"], "42");
    }

    #[test]
    fn preserves_declaration_order() {
        let params = extract_pattern("/a/:first/:second", "/a/x/y").unwrap();
        let names: Vec<&String> = params.keys().collect();
        assert_eq!(names, ["first", "second"]);
        assert_eq!(params["first"], "x");
        assert_eq!(params["second"], "y");
    }

    #[test]
    fn no_match_on_wrong_segment_count() {
        assert!(extract_pattern("/device/:id", "/device/7/rssi").is_none());
        assert!(extract_pattern("/device/:id/rssi", "/device/7").is_none());
    }

    #[test]
    fn no_match_on_literal_mismatch() {
        assert!(extract_pattern("/device/:id/rssi", "/device/7/battery").is_none());
    }

    #[test]
    fn placeholder_never_crosses_slash() {
        assert!(extract_pattern("/device/:id", "/device/7/8").is_none());
    }

    #[test]
    fn no_match_on_empty_segment() {
        assert!(extract_pattern("/device/:id", "/device/").is_none());
    }

    #[test]
    fn literal_match_yields_empty_map() {
        let params = extract_pattern("/devices", "/devices").unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn duplicate_placeholder_rejected() {
        assert!(extract_pattern("/pair/:id/:id", "/pair/1/2").is_none());
    }

    #[test]
    fn captures_are_literal_substrings() {
        let params = extract_pattern("/device/:id", "/device/abc").unwrap();
        assert_eq!(params["id"], "abc");
    }
}

//! Pseudocode post-processing for extracted decryptors.
//!
//! Recovered expressions are emitted with placeholder markers that the
//! printer substitutes later. Duplicate `_rotNN(...)` subexpressions are
//! factored into numbered locals; the capture walks parentheses with a depth
//! counter because the nested-call depth is unbounded.

/// Placeholder for the generated function's name.
pub const FUNCTION_NAME: &str = "<FunctionName>";

/// Placeholder for the generated function's single parameter.
pub const PARAM_NAME: &str = "<ParamName>";

/// Prefix for factored locals: `<V>1`, `<V>2`, ...
pub const VAR_PREFIX: &str = "<V>";

const ROTATE_PREFIX: &str = "_rot";

/// Capture every complete `_rotr(...)` / `_rotl(...)` / `_rotr64(...)` /
/// `_rotl64(...)` call, parenthesis-balanced. An outer call consumes its
/// nested calls; scanning resumes past each capture.
fn capture_rotation_calls(pseudocode: &str) -> Vec<String> {
    let bytes = pseudocode.as_bytes();
    let mut occurrences = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let Some(found) = pseudocode[i..].find(ROTATE_PREFIX) else {
            break;
        };

        let start = i + found;
        let mut cursor = start + ROTATE_PREFIX.len();

        // Direction suffix: r or l.
        match bytes.get(cursor) {
            Some(b'r') | Some(b'l') => cursor += 1,
            _ => {
                i = start + 1;
                continue;
            }
        }

        // Optional width suffix "64".
        if pseudocode[cursor..].starts_with("64") {
            cursor += 2;
        }

        if bytes.get(cursor) != Some(&b'(') {
            i = start + 1;
            continue;
        }

        let mut depth = 1usize;
        cursor += 1;

        while cursor < bytes.len() && depth > 0 {
            match bytes[cursor] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            cursor += 1;
        }

        if depth != 0 {
            break; // mismatched parentheses
        }

        occurrences.push(pseudocode[start..cursor].to_string());
        i = cursor;
    }

    occurrences
}

/// Build the function body: hoist rotation subexpressions occurring at
/// least twice into `<V>N` locals (numbered by first appearance), then wrap
/// the expression in a return statement.
pub fn make_function_body(width: &str, pseudocode: &str) -> String {
    let occurrences = capture_rotation_calls(pseudocode);

    let mut duplicated: Vec<&String> = Vec::new();
    for occurrence in &occurrences {
        let count = occurrences.iter().filter(|o| *o == occurrence).count();

        if count >= 2 && !duplicated.contains(&occurrence) {
            duplicated.push(occurrence);
        }
    }

    if duplicated.is_empty() {
        return format!("  return {};", pseudocode);
    }

    let mut declarations = String::new();
    let mut body = pseudocode.to_string();

    for (index, expr) in duplicated.iter().enumerate() {
        let var = format!("{}{}", VAR_PREFIX, index + 1);
        declarations.push_str(&format!("  {} {} = {};\n", width, var, expr));
        body = body.replace(expr.as_str(), &var);
    }

    format!("{}  return {};", declarations, body)
}

/// Wrap a processed body in the single-parameter function scope the printer
/// expects.
pub fn add_function_scope(width: &str, body: &str) -> String {
    format!(
        "{} {}({} {})\n{{\n{}\n}}",
        width, FUNCTION_NAME, width, PARAM_NAME, body
    )
}

/// Full pipeline: factor duplicates, add the return, wrap in scope.
pub fn make_function(width: &str, pseudocode: &str) -> String {
    add_function_scope(width, &make_function_body(width, pseudocode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_single_call() {
        let calls = capture_rotation_calls("_rotr64(<ParamName> ^ 0x11, 0x05)");
        assert_eq!(calls, vec!["_rotr64(<ParamName> ^ 0x11, 0x05)"]);
    }

    #[test]
    fn test_capture_nested_consumes_inner() {
        let text = "_rotl(_rotr(<ParamName>, 0x01), 0x02) ^ _rotr(<ParamName>, 0x03)";
        let calls = capture_rotation_calls(text);
        assert_eq!(
            calls,
            vec![
                "_rotl(_rotr(<ParamName>, 0x01), 0x02)",
                "_rotr(<ParamName>, 0x03)",
            ]
        );
    }

    #[test]
    fn test_single_occurrence_introduces_no_locals() {
        let body = make_function_body(
            "std::uint64_t",
            "(_rotr64(<ParamName> ^ 0x11, 0x05) ^ 0x22) >> 0x03",
        );
        assert_eq!(
            body,
            "  return (_rotr64(<ParamName> ^ 0x11, 0x05) ^ 0x22) >> 0x03;"
        );
    }

    #[test]
    fn test_duplicates_are_factored() {
        let expr = "_rotr(<ParamName>, 0x07) ^ _rotr(<ParamName>, 0x07)";
        let body = make_function_body("std::uint32_t", expr);

        assert_eq!(
            body,
            "  std::uint32_t <V>1 = _rotr(<ParamName>, 0x07);\n  return <V>1 ^ <V>1;"
        );
    }

    #[test]
    fn test_function_scope() {
        let function = make_function("std::uint64_t", "<ParamName> ^ 0x1");
        assert_eq!(
            function,
            "std::uint64_t <FunctionName>(std::uint64_t <ParamName>)\n{\n  return <ParamName> ^ 0x1;\n}"
        );
    }
}

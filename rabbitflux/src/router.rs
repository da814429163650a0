//! Path to routing-key translation for resource addressing.
//!
//! Resource paths look like URL paths (`/v1/users/1337`). Topic exchanges route
//! on dot-delimited keys, so `/v1/users/1337` is published as `v1.users.1337`
//! and a service registering `/v1/users` binds `v1.users.#` to receive the
//! resource and every sub-path below it.

/// Convert a resource path into the exact routing key used when publishing.
///
/// A single leading and a single trailing `/` are dropped, every other `/`
/// becomes `.`.
pub fn path_to_routing_key(path: &str) -> String {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);
    trimmed.replace('/', ".")
}

/// Binding pattern for a registered resource path: the path's key plus all sub-keys.
pub fn binding_key(path: &str) -> String {
    let key = path_to_routing_key(path);
    if key.is_empty() {
        // root resource receives everything
        "#".to_string()
    } else {
        format!("{key}.#")
    }
}

/// AMQP topic matching: `*` matches exactly one word, `#` matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    match_words(&words(pattern), &words(routing_key))
}

fn words(key: &str) -> Vec<&str> {
    // an empty key has zero words, not one empty word
    if key.is_empty() {
        Vec::new()
    } else {
        key.split('.').collect()
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => match_words(rest, key_rest),
            _ => false,
        },
    }
}

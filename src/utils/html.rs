// src/utils/html.rs

/// Sanitizes worked-solution text attached to answer key entries.
///
/// Whitelist-based: formatting tags such as <b>, <sub> and <p> survive, while
/// <script>, <iframe> and event-handler attributes are stripped together with
/// their content. Solutions are rendered as HTML by the report viewer, so this
/// runs on every write path that accepts solution text.
pub fn clean_html(input: &str) -> String {
    ammonia::clean(input)
}

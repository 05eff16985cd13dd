//! Stream path helpers.

/// `/ws/<name>` for a single raw stream.
pub fn single_stream_path(name: &str) -> String {
    format!("/ws/{}", name)
}

/// `/stream?streams=a/b/c` for a combined stream, names kept in the order given.
pub fn combined_stream_path<I, S>(names: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect::<Vec<_>>()
        .join("/");
    format!("/stream?streams={}", joined)
}

/// User-data stream path for a listen key.
pub fn user_data_path(listen_key: &str) -> String {
    single_stream_path(listen_key)
}

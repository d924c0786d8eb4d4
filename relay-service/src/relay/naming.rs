//! Destination names for relayed files

/// Strip any directory components a client smuggled into the file name.
/// Names that reduce to nothing become `upload`.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or("")
        .trim();

    match base {
        "" | "." | ".." => "upload".to_string(),
        name => name.to_string(),
    }
}

/// Hands out destination names for one batch.
///
/// With prefixing on, names are `<millis>_<name>`. The millisecond prefix is
/// strictly increasing within a batch, so two files with the same original
/// name never collide even when they are relayed within the same millisecond.
#[derive(Debug, Clone)]
pub struct DestinationNamer {
    timestamp_prefix: bool,
    last_millis: Option<i64>,
}

impl DestinationNamer {
    pub fn new(timestamp_prefix: bool) -> Self {
        Self {
            timestamp_prefix,
            last_millis: None,
        }
    }

    pub fn next_name(&mut self, original: &str, now_millis: i64) -> String {
        let name = sanitize_file_name(original);
        if !self.timestamp_prefix {
            return name;
        }

        let millis = match self.last_millis {
            Some(last) if now_millis <= last => last + 1,
            _ => now_millis,
        };
        self.last_millis = Some(millis);

        format!("{}_{}", millis, name)
    }
}

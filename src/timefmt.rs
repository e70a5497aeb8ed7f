use chrono::Local;

/// Human-readable wall-clock timestamp used in task and slot records.
///
/// The `YYYY-MM-DD HH:MM:SS` shape is part of the wire format: workers embed
/// it in `/status` snapshots and heartbeat payloads.
pub(crate) fn human_now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_now_has_expected_shape() {
        let stamp = human_now();
        assert_eq!(stamp.len(), 19);
        assert_eq!(&stamp[4..5], "-");
        assert_eq!(&stamp[13..14], ":");
    }
}

use time::{format_description::well_known::Rfc3339, OffsetDateTime, PrimitiveDateTime};

pub(crate) fn now_epoch_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn primitive_now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

pub(crate) fn format_offset(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_epoch_ms_matches_wall_clock_seconds() {
        let ms = now_epoch_ms();
        let now = OffsetDateTime::now_utc().unix_timestamp();
        assert!((ms / 1000 - now).abs() <= 1, "epoch ms drifted: {ms}");
    }

    #[test]
    fn format_offset_outputs_rfc3339() {
        let value = OffsetDateTime::from_unix_timestamp(1_735_819_230).unwrap();
        let rendered = format_offset(value);
        assert!(rendered.starts_with("2025-01-02T"), "got {rendered}");
        assert!(rendered.ends_with('Z'));
    }
}

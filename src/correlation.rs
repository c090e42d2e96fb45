//! Correlation identifiers for request tracing.
//!
//! Every request entering the platform is tagged with a correlation ID that
//! travels through the job record, the result record, every log entry, and
//! the response header. Clients may supply their own via the
//! `X-Correlation-ID` header; otherwise the front-end mints one.
//!
//! Format: `{service}-{unix-seconds}-{6-hex-random}`, e.g.
//! `api-1699564823-a3f9c2`. Uniqueness is probabilistic (24 random bits plus
//! a second-granularity timestamp) which is sufficient for the seconds-long
//! wait window of any in-flight request.

use rand::Rng;

/// HTTP header carrying the correlation ID in both directions.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Generates a new correlation ID for the given service.
pub fn generate(service: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp();
    let random: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    format!("{}-{}-{:06x}", service, timestamp, random)
}

/// Adopts an inbound correlation ID if present and non-empty, otherwise
/// generates a fresh one for `service`.
pub fn or_generate(inbound: Option<&str>, service: &str) -> String {
    match inbound {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate(service),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_format() {
        let id = generate("api");
        let parts: Vec<&str> = id.splitn(3, '-').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "api");
        assert!(parts[1].parse::<i64>().is_ok(), "timestamp segment: {}", id);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_is_unique_enough() {
        let a = generate("worker");
        let b = generate("worker");
        // Same second is likely; the random suffix should still differ.
        assert_ne!(a, b);
    }

    #[test]
    fn test_or_generate_adopts_inbound() {
        let id = or_generate(Some("trace-xyz"), "api");
        assert_eq!(id, "trace-xyz");
    }

    #[test]
    fn test_or_generate_mints_when_missing() {
        let id = or_generate(None, "api");
        assert!(id.starts_with("api-"));

        let id = or_generate(Some(""), "api");
        assert!(id.starts_with("api-"));
    }
}

//! Tests for logging configuration and format parsing
//!
//! Only the pure helpers are exercised; installing a global subscriber would
//! leak into every other test in the binary.

use rtl433_mqtt::observability::logging::{level_for_verbosity, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    for input in ["json", "JSON", "Json"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
    for input in ["pretty", "PRETTY", "Pretty"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Pretty);
    }
    for input in ["compact", "COMPACT", "Compact"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact);
    }
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    for input in ["invalid", "", "xml", "123", "  compact  "] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input {input:?}");
    }
}

#[test]
fn test_level_names_from_environment() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level("Warn"), Level::WARN);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

#[test]
fn test_verbose_flags_never_lower_the_level() {
    let bases = [Level::ERROR, Level::WARN, Level::INFO, Level::DEBUG, Level::TRACE];
    for base in bases {
        for verbose in 0..4u8 {
            let level = level_for_verbosity(base, verbose);
            assert!(level >= base, "{base} with -v x{verbose} became {level}");
        }
    }
}

#[test]
fn test_double_verbose_is_trace() {
    assert_eq!(level_for_verbosity(Level::ERROR, 2), Level::TRACE);
    assert_eq!(level_for_verbosity(Level::WARN, 1), Level::DEBUG);
}

use serde::Serialize;
use std::fmt;

/// A sample rate supported by the device firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleRate {
    /// Inter-sample delay byte understood by the firmware
    pub timing_code: u8,
    /// Human-readable label (e.g. "1MHz")
    pub label: &'static str,
    /// Nominal samples per second
    pub samples_per_second: u32,
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

const SAMPLE_RATES: [SampleRate; 10] = [
    SampleRate { timing_code: 1, label: "24MHz", samples_per_second: 24_000_000 },
    SampleRate { timing_code: 2, label: "16MHz", samples_per_second: 16_000_000 },
    SampleRate { timing_code: 3, label: "12MHz", samples_per_second: 12_000_000 },
    SampleRate { timing_code: 5, label: "8MHz", samples_per_second: 8_000_000 },
    SampleRate { timing_code: 11, label: "4MHz", samples_per_second: 4_000_000 },
    SampleRate { timing_code: 24, label: "2MHz", samples_per_second: 2_000_000 },
    SampleRate { timing_code: 47, label: "1MHz", samples_per_second: 1_000_000 },
    SampleRate { timing_code: 95, label: "500kHz", samples_per_second: 500_000 },
    SampleRate { timing_code: 191, label: "250kHz", samples_per_second: 250_000 },
    SampleRate { timing_code: 239, label: "200kHz", samples_per_second: 200_000 },
];

impl SampleRate {
    /// Find a rate by its label. Returns `None` for unknown labels.
    pub fn lookup(label: &str) -> Option<&'static SampleRate> {
        SAMPLE_RATES.iter().find(|rate| rate.label == label)
    }

    /// All supported rates, fastest first
    pub fn all() -> &'static [SampleRate] {
        &SAMPLE_RATES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_known_rate() {
        let rate = SampleRate::lookup("1MHz").expect("1MHz should exist");
        assert_eq!(rate.timing_code, 47);
        assert_eq!(rate.samples_per_second, 1_000_000);
    }

    #[test]
    fn test_lookup_unknown_rate() {
        assert!(SampleRate::lookup("99MHz").is_none());
        assert!(SampleRate::lookup("1mhz").is_none());
        assert!(SampleRate::lookup("").is_none());
    }

    #[test]
    fn test_labels_are_unique() {
        let labels: HashSet<_> = SampleRate::all().iter().map(|r| r.label).collect();
        assert_eq!(labels.len(), SampleRate::all().len());
    }

    #[test]
    fn test_timing_codes_grow_as_rate_drops() {
        for pair in SampleRate::all().windows(2) {
            assert!(pair[0].timing_code < pair[1].timing_code);
            assert!(pair[0].samples_per_second > pair[1].samples_per_second);
        }
    }
}

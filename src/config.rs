use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;

use crate::mode::Mode;

/// CREATE2 vanity address miner. Searches for salts whose resulting contract
/// address scores against the selected predicate, across all usable OpenCL
/// devices.
#[derive(Debug, Parser)]
#[command(name = "dredge", version, about)]
pub struct Config {
    /// Target contract-deploying address, 20 bytes of hex.
    #[arg(short = 'A', long)]
    pub address: String,

    /// Init code as a 0x-prefixed hex string.
    #[arg(short = 'I', long, default_value = "")]
    pub init_code: String,

    /// Read init code from this file instead.
    #[arg(short = 'i', long)]
    pub init_code_file: Option<PathBuf>,

    /// Run without any scoring, a benchmark.
    #[arg(long)]
    pub benchmark: bool,

    /// Score on zeros anywhere in the address.
    #[arg(long)]
    pub zeros: bool,

    /// Score on zero bytes anywhere in the address.
    #[arg(long)]
    pub zero_bytes: bool,

    /// Score on letters anywhere in the address.
    #[arg(long)]
    pub letters: bool,

    /// Score on numbers anywhere in the address.
    #[arg(long)]
    pub numbers: bool,

    /// Score on addresses leading with the given hex character.
    #[arg(long, value_name = "HEX CHAR")]
    pub leading: Option<char>,

    /// Score on addresses matching the given hex string; non-hex characters
    /// are wildcards.
    #[arg(long, value_name = "HEX STRING")]
    pub matching: Option<String>,

    /// Score on addresses leading with characters within the --min/--max range.
    #[arg(long)]
    pub leading_range: bool,

    /// Score on characters within the --min/--max range anywhere.
    #[arg(long)]
    pub range: bool,

    /// Score on mirroring from the center.
    #[arg(long)]
    pub mirror: bool,

    /// Score on addresses leading with hexadecimal pairs.
    #[arg(long)]
    pub leading_doubles: bool,

    /// Range minimum (inclusive), 0 is '0', 15 is 'f'.
    #[arg(short = 'm', long, default_value_t = 0)]
    pub min: u8,

    /// Range maximum (inclusive), 0 is '0', 15 is 'f'.
    #[arg(short = 'M', long, default_value_t = 0)]
    pub max: u8,

    /// Skip the device with this index; may be repeated.
    #[arg(short = 's', long = "skip", value_name = "INDEX")]
    pub skip: Vec<usize>,

    /// Local work size; 0 lets the device choose.
    #[arg(short = 'w', long = "work", default_value_t = 128)]
    pub worksize_local: u64,

    /// Maximum single-launch work size; 0 uses --size.
    #[arg(short = 'W', long = "work-max", default_value_t = 0)]
    pub worksize_max: u64,

    /// Do not load or save precompiled kernel binaries.
    #[arg(short = 'n', long)]
    pub no_cache: bool,

    /// Number of salts tried per round.
    #[arg(short = 'S', long, default_value_t = 16_777_216)]
    pub size: u64,
}

impl Config {
    /// Build the scoring mode from the selected flags, first match wins in
    /// the documented order.
    pub fn mode(&self) -> Result<Mode> {
        if self.benchmark {
            Ok(Mode::benchmark())
        } else if self.zeros {
            Ok(Mode::zeros())
        } else if self.zero_bytes {
            Ok(Mode::zero_bytes())
        } else if self.letters {
            Ok(Mode::letters())
        } else if self.numbers {
            Ok(Mode::numbers())
        } else if let Some(c) = self.leading {
            Mode::leading(c)
        } else if let Some(pattern) = &self.matching {
            Mode::matching(pattern)
        } else if self.leading_range {
            Mode::leading_range(self.min, self.max)
        } else if self.range {
            Mode::range(self.min, self.max)
        } else if self.mirror {
            Ok(Mode::mirror())
        } else if self.leading_doubles {
            Ok(Mode::doubles())
        } else {
            bail!("no scoring mode selected, see --help");
        }
    }

    pub fn worksize_max(&self) -> u64 {
        if self.worksize_max == 0 {
            self.size
        } else {
            self.worksize_max
        }
    }

    pub fn worksize_local(&self) -> Option<u64> {
        if self.worksize_local == 0 {
            None
        } else {
            Some(self.worksize_local)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ScoreFunction;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["dredge", "-A", "0x00000000000000000000000000000000deadbeef"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).expect("arguments parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = parse(&["--benchmark"]);
        assert_eq!(cfg.size, 16_777_216);
        assert_eq!(cfg.worksize_local(), Some(128));
        assert_eq!(cfg.worksize_max(), cfg.size);
        assert!(!cfg.no_cache);
        assert!(cfg.skip.is_empty());
    }

    #[test]
    fn worksize_overrides() {
        let cfg = parse(&["--benchmark", "-w", "0", "-W", "4096"]);
        assert_eq!(cfg.worksize_local(), None);
        assert_eq!(cfg.worksize_max(), 4096);
    }

    #[test]
    fn mode_selection_precedence() {
        assert_eq!(
            parse(&["--benchmark", "--mirror"]).mode().unwrap().function,
            ScoreFunction::Benchmark
        );
        assert_eq!(
            parse(&["--zeros"]).mode().unwrap().function,
            ScoreFunction::Range
        );
        assert_eq!(
            parse(&["--leading", "b"]).mode().unwrap().function,
            ScoreFunction::Leading
        );
        assert_eq!(
            parse(&["--matching", "dead"]).mode().unwrap().function,
            ScoreFunction::Matching
        );
        assert_eq!(
            parse(&["--leading-range", "-m", "2", "-M", "5"])
                .mode()
                .unwrap()
                .function,
            ScoreFunction::LeadingRange
        );
    }

    #[test]
    fn missing_mode_is_rejected() {
        assert!(parse(&[]).mode().is_err());
    }

    #[test]
    fn bad_range_surfaces_from_mode_factory() {
        assert!(parse(&["--range", "-m", "9", "-M", "2"]).mode().is_err());
    }

    #[test]
    fn skip_accumulates() {
        let cfg = parse(&["--benchmark", "-s", "0", "-s", "2"]);
        assert_eq!(cfg.skip, vec![0, 2]);
    }
}

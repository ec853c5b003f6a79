//! CLI argument parsing

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tapkit_core::{ProtocolType, Uid};
use tapkit_protocol::MfClassicKey;

/// Parse one byte written as hex, with or without a `0x` prefix.
fn parse_hex_u8(s: &str) -> Result<u8, String> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u8::from_str_radix(digits, 16).map_err(|e| format!("Invalid hex byte: {e}"))
}

/// Parse an ATQA written as four hex digits, first byte first.
fn parse_atqa(s: &str) -> Result<[u8; 2], String> {
    let bytes = tapkit_core::parse_hex(s).map_err(|e| e.to_string())?;
    <[u8; 2]>::try_from(bytes.as_slice()).map_err(|_| format!("ATQA must be 2 bytes: {s}"))
}

#[derive(Parser)]
#[command(name = "tapkit")]
#[command(author, version, about = "NFC card engine", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Worker configuration file (JSON)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read a simulated card and optionally save it
    Read(ReadArgs),

    /// Print a saved device file
    Show {
        /// Device file path
        path: PathBuf,
    },

    /// Load a key dictionary and report its size
    Dict {
        /// Dictionary file path
        path: PathBuf,

        /// Merge the built-in keys before counting
        #[arg(long)]
        with_builtin: bool,
    },
}

/// Kind of card placed in the simulated field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CardKind {
    /// Bare ISO14443-3A tag
    Plain,
    /// ISO14443-4A smart card
    Iso4,
    /// Mifare Classic Mini
    Mini,
    /// Mifare Classic 1K
    #[value(name = "1k")]
    Classic1k,
    /// Mifare Classic 4K
    #[value(name = "4k")]
    Classic4k,
}

/// Simulated card description
#[derive(Args, Debug, Clone)]
pub struct CardArgs {
    /// Card kind
    #[arg(long = "card", value_enum, default_value = "1k")]
    pub kind: CardKind,

    /// UID in hex (4, 7 or 10 bytes)
    #[arg(long, default_value = "04A1B2C3")]
    pub uid: Uid,

    /// ATQA override in hex, e.g. 4400
    #[arg(long, value_parser = parse_atqa)]
    pub atqa: Option<[u8; 2]>,

    /// SAK override in hex, e.g. 0x08
    #[arg(long, value_parser = parse_hex_u8)]
    pub sak: Option<u8>,

    /// Sector key of a simulated Mifare Classic card
    #[arg(long, default_value = "FFFFFFFFFFFF")]
    pub key: MfClassicKey,

    /// Sectors protected by a key no dictionary knows (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub locked: Vec<u8>,
}

#[derive(Args, Debug, Clone)]
pub struct ReadArgs {
    #[command(flatten)]
    pub card: CardArgs,

    /// Only accept cards of this protocol family
    #[arg(long)]
    pub expect: Option<ProtocolType>,

    /// Extra key dictionary for Mifare Classic
    #[arg(short, long)]
    pub dict: Option<PathBuf>,

    /// Save the card to this device file
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case("0x08", Ok(0x08))]
    #[case("20", Ok(0x20))]
    #[case("0X88", Ok(0x88))]
    fn test_parse_hex_u8(#[case] input: &str, #[case] expected: Result<u8, String>) {
        assert_eq!(parse_hex_u8(input), expected);
    }

    #[test]
    fn test_parse_hex_u8_rejects_garbage() {
        assert!(parse_hex_u8("zz").is_err());
        assert!(parse_hex_u8("100").is_err());
    }

    #[test]
    fn test_parse_atqa() {
        assert_eq!(parse_atqa("4400"), Ok([0x44, 0x00]));
        assert_eq!(parse_atqa("04 00"), Ok([0x04, 0x00]));
        assert!(parse_atqa("44").is_err());
    }

    #[test]
    fn test_read_arguments() {
        let cli = Cli::parse_from([
            "tapkit", "read", "--card", "mini", "--uid", "DEADBEEF", "--locked", "1,3", "-o",
            "card.nfc",
        ]);
        let Commands::Read(args) = cli.command else {
            panic!("expected the read command");
        };
        assert_eq!(args.card.kind, CardKind::Mini);
        assert_eq!(args.card.uid.as_bytes(), &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(args.card.locked, vec![1, 3]);
        assert_eq!(args.card.key, MfClassicKey::DEFAULT);
        assert_eq!(args.output, Some(PathBuf::from("card.nfc")));
    }

    #[test]
    fn test_expect_accepts_protocol_names() {
        let cli = Cli::parse_from(["tapkit", "read", "--expect", "mifare classic"]);
        let Commands::Read(args) = cli.command else {
            panic!("expected the read command");
        };
        assert_eq!(args.expect, Some(ProtocolType::MfClassic));
    }
}

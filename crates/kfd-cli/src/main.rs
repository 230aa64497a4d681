//! P25 KFD command-line harness.
//!
//! Drives every manual-rekey operation through the full `kfd-core` stack.
//! On a host there is no radio on the end of a cable, so the harness
//! attaches the core to a virtual wire with a scripted radio on the far
//! side; the bytes, timing, and session flow are the real thing.  On
//! target hardware the same dispatcher runs over a GPIO `LineDriver`
//! implementation instead.
//!
//! Logging goes through `tracing`; set `RUST_LOG=debug` (or `trace` for
//! per-byte output) to watch the protocol at work.

mod config;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use kfd_core::protocol::messages::algorithm;
use kfd_core::sim::{RadioBehavior, VirtualRadio};
use kfd_core::twi::virt::VirtualWire;
use kfd_core::{Kfd, KeyItem};

#[derive(Debug, Parser)]
#[command(
    name = "kfd",
    about = "P25 Key Fill Device harness (TIA-102.AACD-A manual rekeying over TWI)",
    version
)]
struct Cli {
    /// Path to the device config file.  Defaults to the platform config
    /// directory; a missing file means defaults (4 kbaud, Busy stop bits).
    #[arg(long, env = "KFD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the transmit speed in kilobaud (1-9).
    #[arg(long)]
    tx_kbaud: Option<u8>,

    /// Override the receive speed in kilobaud (1-9).
    #[arg(long)]
    rx_kbaud: Option<u8>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the line-driver hardware checks.
    SelfTest,
    /// Open a session to learn the peer type, then disconnect.
    Detect,
    /// List the radio's active keyset ids.
    Inventory,
    /// Load one traffic key.
    Keyload {
        /// Keyset to load into (1-255).
        #[arg(long, default_value_t = 1)]
        keyset: u16,
        /// Storage location number (CKR).
        #[arg(long)]
        sln: u16,
        /// Key id; defaults to the SLN.
        #[arg(long)]
        key_id: Option<u16>,
        /// Algorithm: a name (aes256, aes128, des-ofb, tdes2, tdes3,
        /// arc4, adp) or a hex id like 0x84.
        #[arg(long, default_value = "aes256")]
        algorithm: String,
        /// Key material as hex, e.g. "1112...".  Spaces and colons are
        /// ignored.
        #[arg(long)]
        key: String,
    },
    /// Erase the key at one storage location.
    Erase {
        #[arg(long, default_value_t = 1)]
        keyset: u16,
        #[arg(long)]
        sln: u16,
    },
    /// Erase every key the radio holds.
    Zeroize,
    /// Write the current configuration to the config file.
    InitConfig,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => config::default_config_path().context("resolving config path")?,
    };
    let mut device_config = config::load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    if let Some(kbaud) = cli.tx_kbaud {
        device_config.tx_kbaud = kbaud;
    }
    if let Some(kbaud) = cli.rx_kbaud {
        device_config.rx_kbaud = kbaud;
    }

    if matches!(cli.command, Command::InitConfig) {
        config::save_config(&config_path, &device_config)?;
        println!("wrote {}", config_path.display());
        return Ok(());
    }

    // Attach the core to the virtual wire with a scripted radio on the
    // far end.  A hardware build constructs `Kfd` over its GPIO
    // `LineDriver` here instead.
    let wire = VirtualWire::new();
    let _radio = VirtualRadio::spawn(&wire, &device_config, RadioBehavior::default());
    let mut kfd = Kfd::new(wire.endpoint(), device_config).context("initialising KFD")?;

    match cli.command {
        Command::SelfTest => match kfd.self_test() {
            Ok(()) => println!("self test passed"),
            Err(fault) => bail!("self test failed: {fault} (code 0x{:02X})", fault.code()),
        },
        Command::Detect => {
            let peer = kfd.detect().context("detecting peer")?;
            println!("peer: {peer}");
        }
        Command::Inventory => {
            let report = kfd.inventory().context("inventory")?;
            if report.keyset_ids.is_empty() {
                println!("no active keysets");
            } else {
                println!(
                    "active keysets: {}",
                    report
                        .keyset_ids
                        .iter()
                        .map(|id| id.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
        }
        Command::Keyload {
            keyset,
            sln,
            key_id,
            algorithm,
            key,
        } => {
            let algorithm_id = parse_algorithm(&algorithm)?;
            let key = parse_hex(&key).context("parsing key material")?;
            let item = KeyItem {
                keyset_id: keyset,
                sln,
                key_id: key_id.unwrap_or(sln),
                algorithm_id,
                key,
                erase: false,
            };
            info!(
                sln,
                algorithm = algorithm::name(algorithm_id),
                kek = item.is_kek(),
                "loading key"
            );
            kfd.keyload(&item).context("keyload")?;
            println!("key loaded: sln {sln}, {}", algorithm::name(algorithm_id));
        }
        Command::Erase { keyset, sln } => {
            kfd.erase_key(keyset, sln).context("erase")?;
            println!("key erased: sln {sln}");
        }
        Command::Zeroize => {
            kfd.erase_all().context("zeroize")?;
            println!("all keys erased");
        }
        Command::InitConfig => unreachable!("handled above"),
    }

    Ok(())
}

/// Parses an algorithm name or hex id.
fn parse_algorithm(input: &str) -> anyhow::Result<u8> {
    let normalized = input.to_ascii_lowercase().replace(['-', '_'], "");
    Ok(match normalized.as_str() {
        "aes256" => algorithm::AES_256,
        "aes128" => algorithm::AES_128,
        "desofb" | "des" => algorithm::DES_OFB,
        "tdes2" | "2key3des" => algorithm::TDES_2KEY,
        "tdes3" | "3key3des" => algorithm::TDES_3KEY,
        "arc4" => algorithm::ARC4,
        "adp" => algorithm::ADP,
        "clear" => algorithm::CLEAR,
        _ => {
            let hex = normalized
                .strip_prefix("0x")
                .unwrap_or(normalized.as_str());
            u8::from_str_radix(hex, 16)
                .map_err(|_| anyhow::anyhow!("unknown algorithm: {input}"))?
        }
    })
}

/// Parses hex key material, ignoring spaces and colons.
fn parse_hex(input: &str) -> anyhow::Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if cleaned.len() % 2 != 0 {
        bail!("hex key material must have an even number of digits");
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|_| anyhow::anyhow!("invalid hex at position {i}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_algorithm_names() {
        assert_eq!(parse_algorithm("aes256").unwrap(), 0x84);
        assert_eq!(parse_algorithm("AES-256").unwrap(), 0x84);
        assert_eq!(parse_algorithm("des-ofb").unwrap(), 0x81);
        assert_eq!(parse_algorithm("adp").unwrap(), 0xAA);
    }

    #[test]
    fn test_parse_algorithm_hex_ids() {
        assert_eq!(parse_algorithm("0x84").unwrap(), 0x84);
        assert_eq!(parse_algorithm("9f").unwrap(), 0x9F);
    }

    #[test]
    fn test_parse_algorithm_rejects_nonsense() {
        assert!(parse_algorithm("rot13").is_err());
    }

    #[test]
    fn test_parse_hex_accepts_separators() {
        assert_eq!(
            parse_hex("11:22 33").unwrap(),
            vec![0x11, 0x22, 0x33]
        );
    }

    #[test]
    fn test_parse_hex_rejects_odd_length() {
        assert!(parse_hex("123").is_err());
    }

    #[test]
    fn test_parse_hex_rejects_non_hex() {
        assert!(parse_hex("zz").is_err());
    }
}

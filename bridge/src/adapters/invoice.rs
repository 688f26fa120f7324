//! BOLT11 invoice strings.
//!
//! Routing only needs the human-readable part (`ln` + network + amount + multiplier). Full
//! decoding reads the timestamp and the `p` (payment hash) and `d` (description) tagged fields
//! and skips everything else. The trailing signature is carried but not verified; settling an
//! invoice is the backend's job.

use bech32::primitives::decode::{CheckedHrpstring, UncheckedHrpstring};
use bech32::primitives::iter::{ByteIterExt, Fe32IterExt};
use bech32::{Bech32, Fe32, Hrp};

use crate::adapters::BitcoinNetwork;
use crate::errors::{BridgeError, BridgeResult};

pub const MAX_MEMO_BYTES: usize = 256;

const TIMESTAMP_FES: usize = 7;
const SIGNATURE_FES: usize = 104;
const PAYMENT_HASH_FES: usize = 52;
const TAG_PAYMENT_HASH: u8 = 1;
const TAG_DESCRIPTION: u8 = 13;

/// What the human-readable part alone says about an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvoicePrefix {
    pub network: BitcoinNetwork,
    pub amount_sats: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInvoice {
    pub network: BitcoinNetwork,
    pub amount_sats: Option<u64>,
    pub timestamp: u64,
    pub payment_hash: Option<[u8; 32]>,
    pub memo: Option<String>,
}

impl DecodedInvoice {
    pub fn require_payment_hash(&self) -> BridgeResult<[u8; 32]> {
        self.payment_hash
            .ok_or_else(|| BridgeError::InvalidInvoice("missing payment hash".to_string()))
    }
}

fn network_prefix(network: BitcoinNetwork) -> &'static str {
    match network {
        BitcoinNetwork::Mainnet => "bc",
        BitcoinNetwork::Testnet => "tb",
        BitcoinNetwork::Regtest => "bcrt",
    }
}

fn invalid(reason: &str) -> BridgeError {
    BridgeError::InvalidInvoice(reason.to_string())
}

/// Classify a string as a Lightning invoice from its prefix, without checking the checksum
/// or the data part. Bitcoin addresses and anything else yield `None`.
pub fn invoice_prefix(invoice: &str) -> Option<InvoicePrefix> {
    let unchecked = UncheckedHrpstring::new(invoice.trim()).ok()?;
    parse_hrp(&unchecked.hrp()).ok()
}

fn parse_hrp(hrp: &Hrp) -> BridgeResult<InvoicePrefix> {
    let prefix = hrp.to_lowercase();
    let rest = prefix
        .strip_prefix("ln")
        .ok_or_else(|| invalid("missing ln prefix"))?;

    let (network, amount) = if let Some(amount) = rest.strip_prefix("bcrt") {
        (BitcoinNetwork::Regtest, amount)
    } else if let Some(amount) = rest.strip_prefix("bc") {
        (BitcoinNetwork::Mainnet, amount)
    } else if let Some(amount) = rest.strip_prefix("tb") {
        (BitcoinNetwork::Testnet, amount)
    } else {
        return Err(invalid("unknown network"));
    };

    let amount_sats = parse_amount(amount).ok_or_else(|| invalid("bad amount"))?;
    Ok(InvoicePrefix {
        network,
        amount_sats,
    })
}

pub fn decode_invoice(invoice: &str) -> BridgeResult<DecodedInvoice> {
    let checked =
        CheckedHrpstring::new::<Bech32>(invoice.trim()).map_err(|_| invalid("not bech32"))?;
    let prefix = parse_hrp(&checked.hrp())?;

    let fes = checked
        .data_part_ascii_no_checksum()
        .iter()
        .map(|&c| Fe32::from_char(c as char).map(Fe32::to_u8))
        .collect::<Result<Vec<u8>, _>>()
        .map_err(|_| invalid("bad data character"))?;
    if fes.len() < TIMESTAMP_FES + SIGNATURE_FES {
        return Err(invalid("data part too short"));
    }

    let timestamp = fes[..TIMESTAMP_FES]
        .iter()
        .fold(0u64, |acc, &fe| (acc << 5) | u64::from(fe));

    let mut payment_hash = None;
    let mut memo = None;
    let mut fields = &fes[TIMESTAMP_FES..fes.len() - SIGNATURE_FES];
    while !fields.is_empty() {
        if fields.len() < 3 {
            return Err(invalid("truncated tagged field"));
        }
        let tag = fields[0];
        let len = usize::from(fields[1]) * 32 + usize::from(fields[2]);
        let body = fields
            .get(3..3 + len)
            .ok_or_else(|| invalid("truncated tagged field"))?;

        match tag {
            // Readers skip `p` fields of the wrong length.
            TAG_PAYMENT_HASH if len == PAYMENT_HASH_FES && payment_hash.is_none() => {
                let bytes = fes_to_bytes(body)?;
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes[..32]);
                payment_hash = Some(hash);
            }
            TAG_DESCRIPTION if memo.is_none() => {
                let text = String::from_utf8(fes_to_bytes(body)?)
                    .map_err(|_| invalid("description is not utf-8"))?;
                memo = Some(text);
            }
            _ => {}
        }
        fields = &fields[3 + len..];
    }

    Ok(DecodedInvoice {
        network: prefix.network,
        amount_sats: prefix.amount_sats,
        timestamp,
        payment_hash,
        memo,
    })
}

fn fes_to_bytes(fes: &[u8]) -> BridgeResult<Vec<u8>> {
    let fes = fes
        .iter()
        .map(|&fe| Fe32::try_from(fe))
        .collect::<Result<Vec<Fe32>, _>>()
        .map_err(|_| invalid("bad field element"))?;
    Ok(fes.into_iter().fes_to_bytes().collect())
}

fn push_u5_be(out: &mut Vec<Fe32>, value: u64, width: usize) -> BridgeResult<()> {
    for shift in (0..width).rev() {
        let fe = ((value >> (shift * 5)) & 31) as u8;
        out.push(Fe32::try_from(fe).map_err(|e| BridgeError::Internal(e.to_string()))?);
    }
    Ok(())
}

fn push_tagged(out: &mut Vec<Fe32>, tag: u8, bytes: &[u8]) -> BridgeResult<()> {
    let body: Vec<Fe32> = bytes.iter().copied().bytes_to_fes().collect();
    if body.len() >= 1024 {
        return Err(BridgeError::InvalidParams("tagged field too long".to_string()));
    }
    push_u5_be(out, u64::from(tag), 1)?;
    push_u5_be(out, body.len() as u64, 2)?;
    out.extend(body);
    Ok(())
}

/// Build an invoice for the in-process backends.
///
/// Node signatures need secp256k1 keys this crate does not hold, so the signature slot carries
/// a BLAKE3 digest of the invoice body instead. Real backends issue their own invoices.
pub fn encode_invoice(
    network: BitcoinNetwork,
    amount_sats: u64,
    payment_hash: [u8; 32],
    memo: &str,
    timestamp: u64,
) -> BridgeResult<String> {
    if memo.len() > MAX_MEMO_BYTES {
        return Err(BridgeError::InvalidParams(format!(
            "memo exceeds {} bytes",
            MAX_MEMO_BYTES
        )));
    }
    // One satoshi is ten nano-bitcoin.
    let nano_btc = amount_sats
        .checked_mul(10)
        .ok_or_else(|| BridgeError::InvalidParams("amount too large".to_string()))?;
    let hrp = Hrp::parse(&format!("ln{}{}n", network_prefix(network), nano_btc))
        .map_err(|e| BridgeError::Internal(format!("invoice prefix: {}", e)))?;

    let mut data = Vec::new();
    push_u5_be(&mut data, timestamp & ((1 << 35) - 1), TIMESTAMP_FES)?;
    push_tagged(&mut data, TAG_PAYMENT_HASH, &payment_hash)?;
    push_tagged(&mut data, TAG_DESCRIPTION, memo.as_bytes())?;

    let mut digest = blake3::Hasher::new_derive_key("wallet-bridge in-memory invoice signature");
    digest.update(hrp.as_str().as_bytes());
    digest.update(&data.iter().map(|fe| fe.to_u8()).collect::<Vec<u8>>());
    let mut signature = [0u8; 65];
    digest.finalize_xof().fill(&mut signature[..64]);
    data.extend(signature.iter().copied().bytes_to_fes());

    Ok(data.into_iter().with_checksum::<Bech32>(&hrp).chars().collect())
}

/// `None` inside `Some` means an amountless invoice; outer `None` is a parse failure.
fn parse_amount(raw: &str) -> Option<Option<u64>> {
    if raw.is_empty() {
        return Some(None);
    }
    let (digits, multiplier) = raw.split_at(raw.len() - 1);
    let units: u64 = digits.parse().ok()?;
    let sats = match multiplier {
        "m" => units.checked_mul(100_000)?,
        "u" => units.checked_mul(100)?,
        "n" if units % 10 == 0 => units / 10,
        "p" if units % 10_000 == 0 => units / 10_000,
        _ => return None,
    };
    Some(Some(sats))
}

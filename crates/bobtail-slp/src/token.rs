//! SLP token payload parsing and storage encoding.
//!
//! SLP messages ride in an OP_RETURN output: the LOKAD tag, a token type,
//! a transaction type (GENESIS, MINT, SEND, COMMIT) and the type-specific
//! fields, every one of them a data push. Parsing is strict: a message
//! must consume the script exactly.

use bitcoin::Script;

/// LOKAD protocol tag for the Simple Ledger Protocol, little-endian
/// ("SLP\0" on the wire).
pub const SLP_LOKAD_ID: u32 = 0x0050_4c53;

const OP_RETURN: u8 = 0x6a;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

/// Maximum quantity pushes in a SEND message.
const MAX_SEND_OUTPUTS: usize = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlpTxType {
    /// Empty marker; doubles as the spent state in the UTXO overlay.
    Null = 0,
    Genesis = 1,
    Mint = 2,
    Send = 3,
    Commit = 4,
}

impl SlpTxType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Null),
            1 => Some(Self::Genesis),
            2 => Some(Self::Mint),
            3 => Some(Self::Send),
            4 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Reasons a script is not a well-formed SLP message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SlpParseError {
    #[error("script is not an OP_RETURN")]
    NotOpReturn,
    #[error("forbidden push opcode in SLP payload")]
    ForbiddenPush,
    #[error("payload ends mid-field")]
    Truncated,
    #[error("LOKAD tag must be a four byte push")]
    BadLokadLength,
    #[error("not an SLP payload")]
    WrongProtocol,
    #[error("token type must be one or two bytes")]
    BadTokenTypeLength,
    #[error("unsupported token type")]
    UnsupportedTokenType,
    #[error("unknown transaction type")]
    UnknownTxType,
    #[error("COMMIT messages are not supported")]
    CommitUnsupported,
    #[error("token id must be 32 bytes")]
    BadTokenIdLength,
    #[error("document hash must be empty or 32 bytes")]
    BadDocumentHashLength,
    #[error("decimals must be a single byte no greater than nine")]
    BadDecimals,
    #[error("mint baton vout must be absent or in 0x02..=0xff")]
    BadBatonVout,
    #[error("token quantities must be eight byte pushes")]
    BadQuantityLength,
    #[error("SEND quantity list is malformed")]
    BadSendPayload,
    #[error("SEND carries more than nineteen outputs")]
    TooManySendOutputs,
    #[error("bytes remain after the final field")]
    TrailingBytes,
}

/// A parsed SLP token tracked per outpoint, UTXO-style.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlpToken {
    token_type: u16,
    tx_type: SlpTxType,
    /// Genesis transaction hash; absent in GENESIS itself.
    token_id: Vec<u8>,
    /// Zero when there is no mint baton.
    mint_baton_vout: u8,
    /// SEND only.
    token_output_quantities: Vec<u64>,
    // GENESIS only.
    token_ticker: Vec<u8>,
    token_name: Vec<u8>,
    token_document_url: Vec<u8>,
    token_document_hash: Vec<u8>,
    decimals: u8,
    initial_token_mint_quantity: u64,
    /// MINT only.
    additional_token_quantity: u64,
    /// Height of the block that created this output.
    pub height: u32,
}

impl SlpToken {
    fn null(height: u32) -> Self {
        Self {
            token_type: 0,
            tx_type: SlpTxType::Null,
            token_id: Vec::new(),
            mint_baton_vout: 0,
            token_output_quantities: Vec::new(),
            token_ticker: Vec::new(),
            token_name: Vec::new(),
            token_document_url: Vec::new(),
            token_document_hash: Vec::new(),
            decimals: 0,
            initial_token_mint_quantity: 0,
            additional_token_quantity: 0,
            height,
        }
    }

    /// Parse `script_pub_key` as an SLP message for an output created at
    /// `height`.
    pub fn parse(script_pub_key: &Script, height: u32) -> Result<Self, SlpParseError> {
        let mut reader = Reader::new(script_pub_key.as_bytes());
        if reader.read_u8()? != OP_RETURN {
            return Err(SlpParseError::NotOpReturn);
        }

        let lokad_len = reader.read_push_len()?;
        if lokad_len != 4 {
            return Err(SlpParseError::BadLokadLength);
        }
        let lokad = reader.take(4)?;
        if u32::from_le_bytes([lokad[0], lokad[1], lokad[2], lokad[3]]) != SLP_LOKAD_ID {
            return Err(SlpParseError::WrongProtocol);
        }

        let token_type_len = reader.read_u8()? as usize;
        let token_type = match token_type_len {
            1 => reader.read_u8()? as u16,
            2 => {
                let bytes = reader.take(2)?;
                u16::from_be_bytes([bytes[0], bytes[1]])
            }
            _ => return Err(SlpParseError::BadTokenTypeLength),
        };
        // Only token type 1 exists so far.
        if token_type != 1 {
            return Err(SlpParseError::UnsupportedTokenType);
        }

        // GENESIS and COMMIT are the only types of their length; the four
        // byte types are told apart by content.
        let tx_type_len = reader.read_push_len()?;
        let tx_type_bytes = reader.take(tx_type_len)?;
        let tx_type = match tx_type_len {
            7 => SlpTxType::Genesis,
            6 => SlpTxType::Commit,
            4 if tx_type_bytes == b"MINT" => SlpTxType::Mint,
            4 if tx_type_bytes == b"SEND" => SlpTxType::Send,
            _ => return Err(SlpParseError::UnknownTxType),
        };

        let mut token = Self::null(height);
        token.token_type = token_type;
        token.tx_type = tx_type;
        match tx_type {
            SlpTxType::Genesis => token.parse_genesis(&mut reader)?,
            SlpTxType::Mint => token.parse_mint(&mut reader)?,
            SlpTxType::Send => token.parse_send(&mut reader)?,
            SlpTxType::Commit => return Err(SlpParseError::CommitUnsupported),
            SlpTxType::Null => unreachable!("null is never produced above"),
        }
        Ok(token)
    }

    fn parse_genesis(&mut self, reader: &mut Reader<'_>) -> Result<(), SlpParseError> {
        self.token_ticker = reader.read_push()?.to_vec();
        self.token_name = reader.read_push()?.to_vec();
        self.token_document_url = reader.read_push()?.to_vec();

        let document_hash = reader.read_push()?;
        if document_hash.len() != 32 && !document_hash.is_empty() {
            return Err(SlpParseError::BadDocumentHashLength);
        }
        self.token_document_hash = document_hash.to_vec();

        let decimals = reader.read_push()?;
        if decimals.len() != 1 || decimals[0] > 9 {
            return Err(SlpParseError::BadDecimals);
        }
        self.decimals = decimals[0];

        self.mint_baton_vout = read_baton_vout(reader)?;
        self.initial_token_mint_quantity = read_quantity(reader)?;
        reader.expect_end()
    }

    fn parse_mint(&mut self, reader: &mut Reader<'_>) -> Result<(), SlpParseError> {
        let token_id = reader.read_push()?;
        if token_id.len() != 32 {
            return Err(SlpParseError::BadTokenIdLength);
        }
        self.token_id = token_id.to_vec();

        self.mint_baton_vout = read_baton_vout(reader)?;
        self.additional_token_quantity = read_quantity(reader)?;
        reader.expect_end()
    }

    fn parse_send(&mut self, reader: &mut Reader<'_>) -> Result<(), SlpParseError> {
        let token_id = reader.read_push()?;
        if token_id.len() != 32 {
            return Err(SlpParseError::BadTokenIdLength);
        }
        self.token_id = token_id.to_vec();

        // Each quantity is a one byte push length (always eight) plus the
        // big-endian value.
        let remaining = reader.remaining();
        if remaining % 9 != 0 {
            return Err(SlpParseError::BadSendPayload);
        }
        let outputs = remaining / 9;
        if outputs > MAX_SEND_OUTPUTS {
            return Err(SlpParseError::TooManySendOutputs);
        }
        for _ in 0..outputs {
            self.token_output_quantities.push(read_quantity(reader)?);
        }
        reader.expect_end()
    }

    pub fn tx_type(&self) -> SlpTxType {
        self.tx_type
    }

    pub fn token_id(&self) -> &[u8] {
        &self.token_id
    }

    pub fn mint_baton_vout(&self) -> u8 {
        self.mint_baton_vout
    }

    pub fn output_quantities(&self) -> &[u64] {
        &self.token_output_quantities
    }

    pub fn ticker(&self) -> &[u8] {
        &self.token_ticker
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn initial_mint_quantity(&self) -> u64 {
        self.initial_token_mint_quantity
    }

    pub fn additional_quantity(&self) -> u64 {
        self.additional_token_quantity
    }

    /// A spent token is a null one.
    pub fn is_spent(&self) -> bool {
        self.tx_type == SlpTxType::Null
    }

    pub fn spend(&mut self) {
        *self = Self::null(self.height);
    }

    /// Fixed-layout storage encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        out.extend_from_slice(&self.token_type.to_le_bytes());
        out.push(self.tx_type as u8);
        encode_bytes(&mut out, &self.token_id);
        out.push(self.mint_baton_vout);
        out.extend_from_slice(&(self.token_output_quantities.len() as u32).to_le_bytes());
        for quantity in &self.token_output_quantities {
            out.extend_from_slice(&quantity.to_le_bytes());
        }
        encode_bytes(&mut out, &self.token_ticker);
        encode_bytes(&mut out, &self.token_name);
        encode_bytes(&mut out, &self.token_document_url);
        encode_bytes(&mut out, &self.token_document_hash);
        out.push(self.decimals);
        out.extend_from_slice(&self.initial_token_mint_quantity.to_le_bytes());
        out.extend_from_slice(&self.additional_token_quantity.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SlpCodecError> {
        let mut reader = Reader::new(bytes);
        let token_type = u16::from_le_bytes(reader.take_array::<2>()?);
        let tx_type = SlpTxType::from_u8(reader.take_array::<1>()?[0])
            .ok_or(SlpCodecError::BadTxType)?;
        let token_id = decode_bytes(&mut reader)?;
        let mint_baton_vout = reader.take_array::<1>()?[0];
        let quantity_count = u32::from_le_bytes(reader.take_array::<4>()?) as usize;
        if quantity_count > MAX_SEND_OUTPUTS {
            return Err(SlpCodecError::BadQuantityCount);
        }
        let mut token_output_quantities = Vec::with_capacity(quantity_count);
        for _ in 0..quantity_count {
            token_output_quantities.push(u64::from_le_bytes(reader.take_array::<8>()?));
        }
        let token_ticker = decode_bytes(&mut reader)?;
        let token_name = decode_bytes(&mut reader)?;
        let token_document_url = decode_bytes(&mut reader)?;
        let token_document_hash = decode_bytes(&mut reader)?;
        let decimals = reader.take_array::<1>()?[0];
        let initial_token_mint_quantity = u64::from_le_bytes(reader.take_array::<8>()?);
        let additional_token_quantity = u64::from_le_bytes(reader.take_array::<8>()?);
        let height = u32::from_le_bytes(reader.take_array::<4>()?);

        Ok(Self {
            token_type,
            tx_type,
            token_id,
            mint_baton_vout,
            token_output_quantities,
            token_ticker,
            token_name,
            token_document_url,
            token_document_hash,
            decimals,
            initial_token_mint_quantity,
            additional_token_quantity,
            height,
        })
    }
}

/// Storage codec failures; always mean a corrupt database record.
#[derive(Debug, thiserror::Error)]
pub enum SlpCodecError {
    #[error("token record ends unexpectedly")]
    UnexpectedEof,
    #[error("token record carries an unknown tx type")]
    BadTxType,
    #[error("token record quantity count out of range")]
    BadQuantityCount,
    #[error("token record length field out of range")]
    BadLength,
}

fn encode_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn decode_bytes(reader: &mut Reader<'_>) -> Result<Vec<u8>, SlpCodecError> {
    let len = u32::from_le_bytes(reader.take_array::<4>()?) as usize;
    if len > 10_000 {
        return Err(SlpCodecError::BadLength);
    }
    Ok(reader.take(len).map_err(|_| SlpCodecError::UnexpectedEof)?.to_vec())
}

fn read_baton_vout(reader: &mut Reader<'_>) -> Result<u8, SlpParseError> {
    let push = reader.read_push()?;
    match push {
        [] => Ok(0),
        [vout] if *vout >= 2 => Ok(*vout),
        _ => Err(SlpParseError::BadBatonVout),
    }
}

fn read_quantity(reader: &mut Reader<'_>) -> Result<u64, SlpParseError> {
    let push = reader.read_push()?;
    let bytes: [u8; 8] = push
        .try_into()
        .map_err(|_| SlpParseError::BadQuantityLength)?;
    Ok(u64::from_be_bytes(bytes))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], SlpParseError> {
        if self.remaining() < n {
            return Err(SlpParseError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], SlpCodecError> {
        let slice = self.take(N).map_err(|_| SlpCodecError::UnexpectedEof)?;
        Ok(slice.try_into().expect("slice length just checked"))
    }

    fn read_u8(&mut self) -> Result<u8, SlpParseError> {
        Ok(self.take(1)?[0])
    }

    /// Push length per the SLP grammar: no empty-push opcode, no one byte
    /// literal opcodes, PUSHDATA1/2/4 allowed.
    fn read_push_len(&mut self) -> Result<usize, SlpParseError> {
        let op = self.read_u8()?;
        if op == 0x00 || (0x4f..=0x60).contains(&op) {
            return Err(SlpParseError::ForbiddenPush);
        }
        match op {
            OP_PUSHDATA1 => Ok(self.read_u8()? as usize),
            OP_PUSHDATA2 => {
                let bytes = self.take(2)?;
                Ok(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
            }
            OP_PUSHDATA4 => {
                let bytes = self.take(4)?;
                Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize)
            }
            other => Ok(other as usize),
        }
    }

    fn read_push(&mut self) -> Result<&'a [u8], SlpParseError> {
        let len = self.read_push_len()?;
        self.take(len)
    }

    fn expect_end(&self) -> Result<(), SlpParseError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(SlpParseError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::ScriptBuf;

    fn push(script: &mut Vec<u8>, data: &[u8]) {
        if data.is_empty() {
            // 0x4c 0x00: an empty PUSHDATA1, the SLP empty-field encoding.
            script.extend_from_slice(&[OP_PUSHDATA1, 0]);
        } else {
            script.push(data.len() as u8);
            script.extend_from_slice(data);
        }
    }

    fn slp_prefix(tx_type: &[u8]) -> Vec<u8> {
        let mut script = vec![OP_RETURN];
        push(&mut script, b"SLP\x00");
        push(&mut script, &[0x01]);
        push(&mut script, tx_type);
        script
    }

    fn genesis_script() -> ScriptBuf {
        let mut script = slp_prefix(b"GENESIS");
        push(&mut script, b"TEST");
        push(&mut script, b"Test Token");
        push(&mut script, b"example.com");
        push(&mut script, &[]); // document hash
        push(&mut script, &[8]); // decimals
        push(&mut script, &[2]); // baton vout
        push(&mut script, &1_000_000u64.to_be_bytes());
        ScriptBuf::from_bytes(script)
    }

    #[test]
    fn parses_genesis() {
        let token = SlpToken::parse(&genesis_script(), 7).unwrap();
        assert_eq!(token.tx_type(), SlpTxType::Genesis);
        assert_eq!(token.ticker(), b"TEST");
        assert_eq!(token.decimals(), 8);
        assert_eq!(token.mint_baton_vout(), 2);
        assert_eq!(token.initial_mint_quantity(), 1_000_000);
        assert_eq!(token.height, 7);
        assert!(!token.is_spent());
    }

    #[test]
    fn parses_mint() {
        let mut script = slp_prefix(b"MINT");
        push(&mut script, &[0xab; 32]);
        push(&mut script, &[]); // no baton
        push(&mut script, &500u64.to_be_bytes());
        let token = SlpToken::parse(&ScriptBuf::from_bytes(script), 0).unwrap();
        assert_eq!(token.tx_type(), SlpTxType::Mint);
        assert_eq!(token.token_id(), &[0xab; 32]);
        assert_eq!(token.mint_baton_vout(), 0);
        assert_eq!(token.additional_quantity(), 500);
    }

    #[test]
    fn parses_send_quantities() {
        let mut script = slp_prefix(b"SEND");
        push(&mut script, &[0xcd; 32]);
        push(&mut script, &10u64.to_be_bytes());
        push(&mut script, &20u64.to_be_bytes());
        push(&mut script, &30u64.to_be_bytes());
        let token = SlpToken::parse(&ScriptBuf::from_bytes(script), 0).unwrap();
        assert_eq!(token.tx_type(), SlpTxType::Send);
        assert_eq!(token.output_quantities(), &[10, 20, 30]);
    }

    #[test]
    fn rejects_twenty_send_outputs() {
        let mut script = slp_prefix(b"SEND");
        push(&mut script, &[0xcd; 32]);
        for _ in 0..20 {
            push(&mut script, &1u64.to_be_bytes());
        }
        assert_eq!(
            SlpToken::parse(&ScriptBuf::from_bytes(script), 0),
            Err(SlpParseError::TooManySendOutputs)
        );
    }

    #[test]
    fn rejects_non_slp_scripts() {
        let p2pkh = ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros());
        assert_eq!(
            SlpToken::parse(&p2pkh, 0),
            Err(SlpParseError::NotOpReturn)
        );

        let mut other = vec![OP_RETURN];
        push(&mut other, b"XYZ\x00");
        assert_eq!(
            SlpToken::parse(&ScriptBuf::from_bytes(other), 0),
            Err(SlpParseError::WrongProtocol)
        );
    }

    #[test]
    fn rejects_trailing_bytes_and_bad_fields() {
        let mut trailing = genesis_script().to_bytes();
        trailing.push(0x01);
        trailing.push(0xff);
        assert_eq!(
            SlpToken::parse(&ScriptBuf::from_bytes(trailing), 0),
            Err(SlpParseError::TrailingBytes)
        );

        let mut bad_baton = slp_prefix(b"MINT");
        push(&mut bad_baton, &[0xab; 32]);
        push(&mut bad_baton, &[1]); // below 0x02
        push(&mut bad_baton, &500u64.to_be_bytes());
        assert_eq!(
            SlpToken::parse(&ScriptBuf::from_bytes(bad_baton), 0),
            Err(SlpParseError::BadBatonVout)
        );

        let mut commit = slp_prefix(b"COMMIT");
        commit.push(0x01);
        commit.push(0x00);
        assert_eq!(
            SlpToken::parse(&ScriptBuf::from_bytes(commit), 0),
            Err(SlpParseError::CommitUnsupported)
        );
    }

    #[test]
    fn spend_nulls_the_token() {
        let mut token = SlpToken::parse(&genesis_script(), 9).unwrap();
        token.spend();
        assert!(token.is_spent());
        assert_eq!(token.height, 9);
        assert_eq!(token.ticker(), b"");
    }

    #[test]
    fn storage_codec_round_trips() {
        let token = SlpToken::parse(&genesis_script(), 42).unwrap();
        let decoded = SlpToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);

        let mut send = slp_prefix(b"SEND");
        push(&mut send, &[0x01; 32]);
        push(&mut send, &7u64.to_be_bytes());
        let token = SlpToken::parse(&ScriptBuf::from_bytes(send), 1).unwrap();
        assert_eq!(SlpToken::decode(&token.encode()).unwrap(), token);

        assert!(SlpToken::decode(&[0x01, 0x02]).is_err());
    }
}

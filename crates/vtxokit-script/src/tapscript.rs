//! The closed family of taproot leaf-script templates.
//!
//! Each template is a fixed opcode skeleton around pushed keys and numbers.
//! Decoding is strict: the parsed parameters are re-encoded and the result
//! must equal the input byte-for-byte, so non-minimal pushes and every other
//! non-canonical spelling of the same logical script are rejected.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGADD, OP_CHECKSIGVERIFY, OP_CLTV, OP_CSV, OP_DROP, OP_NUMEQUAL,
    OP_PUSHNUM_1, OP_PUSHNUM_16, OP_VERIFY,
};
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Script, ScriptBuf, Sequence};
use thiserror::Error;

/// Bit 22 of an nSequence value selects time-based relative locks.
const SEQUENCE_TYPE_FLAG: u32 = 1 << 22;

/// Relative-locktime values occupy the low 16 bits of nSequence.
const SEQUENCE_VALUE_MASK: u32 = 0xffff;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TapscriptError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("malformed script: {0}")]
    MalformedScript(&'static str),

    #[error("script is not the canonical encoding of its parameters")]
    ReencodingMismatch,

    #[error("script does not match any known tapscript template")]
    UnknownTapscript,
}

/// How a [`MultisigParams`] script tallies its signature checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultisigMode {
    /// `<pk1> CHECKSIGVERIFY ... <pkn> CHECKSIG`
    CheckSig,
    /// `<pk1> CHECKSIG <pk2> CHECKSIGADD ... <n> NUMEQUAL`
    CheckSigAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimelockUnit {
    Blocks,
    Seconds,
}

/// A CHECKSEQUENCEVERIFY delay, in blocks or in seconds.
///
/// Seconds are consensus-encoded in 512-second units, so a seconds value
/// must be a positive multiple of 512 to survive an encode/decode round
/// trip; the codec rejects anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelativeTimelock {
    pub unit: TimelockUnit,
    pub value: u64,
}

impl RelativeTimelock {
    pub fn blocks(value: u64) -> Self {
        RelativeTimelock { unit: TimelockUnit::Blocks, value }
    }

    pub fn seconds(value: u64) -> Self {
        RelativeTimelock { unit: TimelockUnit::Seconds, value }
    }

    /// The nSequence encoding of this timelock.
    pub fn to_sequence(&self) -> Result<Sequence, TapscriptError> {
        match self.unit {
            TimelockUnit::Blocks => {
                if self.value == 0 {
                    return Err(TapscriptError::InvalidParameter("zero block timelock"));
                }
                let blocks = u16::try_from(self.value)
                    .map_err(|_| TapscriptError::InvalidParameter("block timelock above 65535"))?;
                Ok(Sequence::from_height(blocks))
            }
            TimelockUnit::Seconds => {
                if self.value == 0 {
                    return Err(TapscriptError::InvalidParameter("zero seconds timelock"));
                }
                if self.value % 512 != 0 {
                    return Err(TapscriptError::InvalidParameter(
                        "seconds timelock is not a multiple of 512",
                    ));
                }
                let intervals = u16::try_from(self.value / 512).map_err(|_| {
                    TapscriptError::InvalidParameter("seconds timelock above 512 * 65535")
                })?;
                Ok(Sequence::from_512_second_intervals(intervals))
            }
        }
    }

    /// Recover a timelock from a consensus nSequence value.
    pub fn from_sequence(sequence: Sequence) -> Self {
        let consensus = sequence.to_consensus_u32();
        let low = (consensus & SEQUENCE_VALUE_MASK) as u64;
        if consensus & SEQUENCE_TYPE_FLAG != 0 {
            RelativeTimelock::seconds(low * 512)
        } else {
            RelativeTimelock::blocks(low)
        }
    }
}

/// `<pk1> CHECKSIGVERIFY ... <pkn> CHECKSIG`, or the CHECKSIGADD tally form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigParams {
    pub pubkeys: Vec<XOnlyPublicKey>,
    pub mode: MultisigMode,
}

/// `<sequence> CHECKSEQUENCEVERIFY DROP` followed by a CHECKSIG multisig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvMultisigParams {
    pub timelock: RelativeTimelock,
    pub pubkeys: Vec<XOnlyPublicKey>,
}

/// `<locktime> CHECKLOCKTIMEVERIFY DROP` followed by a CHECKSIG multisig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CltvMultisigParams {
    pub locktime: u64,
    pub pubkeys: Vec<XOnlyPublicKey>,
}

/// `<condition> VERIFY` followed by a CHECKSIG multisig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionMultisigParams {
    pub condition: ScriptBuf,
    pub pubkeys: Vec<XOnlyPublicKey>,
}

/// `<condition> VERIFY` followed by a full CSV multisig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionCsvMultisigParams {
    pub condition: ScriptBuf,
    pub timelock: RelativeTimelock,
    pub pubkeys: Vec<XOnlyPublicKey>,
}

/// One leaf script drawn from the template family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tapscript {
    Multisig(MultisigParams),
    CsvMultisig(CsvMultisigParams),
    CltvMultisig(CltvMultisigParams),
    ConditionMultisig(ConditionMultisigParams),
    ConditionCsvMultisig(ConditionCsvMultisigParams),
}

impl Tapscript {
    /// Encode to the canonical script bytes.
    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        match self {
            Tapscript::Multisig(p) => p.to_script(),
            Tapscript::CsvMultisig(p) => p.to_script(),
            Tapscript::CltvMultisig(p) => p.to_script(),
            Tapscript::ConditionMultisig(p) => p.to_script(),
            Tapscript::ConditionCsvMultisig(p) => p.to_script(),
        }
    }

    /// Try every template in a fixed order and return the first match.
    ///
    /// The templates have distinct opcode skeletons, so the order only
    /// matters for scripts that match none of them.
    pub fn decode_any(script: &Script) -> Result<Tapscript, TapscriptError> {
        if let Ok(p) = MultisigParams::from_script(script) {
            return Ok(Tapscript::Multisig(p));
        }
        if let Ok(p) = CsvMultisigParams::from_script(script) {
            return Ok(Tapscript::CsvMultisig(p));
        }
        if let Ok(p) = ConditionCsvMultisigParams::from_script(script) {
            return Ok(Tapscript::ConditionCsvMultisig(p));
        }
        if let Ok(p) = ConditionMultisigParams::from_script(script) {
            return Ok(Tapscript::ConditionMultisig(p));
        }
        if let Ok(p) = CltvMultisigParams::from_script(script) {
            return Ok(Tapscript::CltvMultisig(p));
        }
        Err(TapscriptError::UnknownTapscript)
    }

    pub fn pubkeys(&self) -> &[XOnlyPublicKey] {
        match self {
            Tapscript::Multisig(p) => &p.pubkeys,
            Tapscript::CsvMultisig(p) => &p.pubkeys,
            Tapscript::CltvMultisig(p) => &p.pubkeys,
            Tapscript::ConditionMultisig(p) => &p.pubkeys,
            Tapscript::ConditionCsvMultisig(p) => &p.pubkeys,
        }
    }
}

impl MultisigParams {
    pub fn new(pubkeys: Vec<XOnlyPublicKey>, mode: MultisigMode) -> Self {
        MultisigParams { pubkeys, mode }
    }

    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        if self.pubkeys.is_empty() {
            return Err(TapscriptError::InvalidParameter("multisig needs at least one pubkey"));
        }
        let mut builder = Builder::new();
        match self.mode {
            MultisigMode::CheckSig => {
                let (last, rest) = self.pubkeys.split_last().expect("checked non-empty");
                for pk in rest {
                    builder = builder.push_x_only_key(pk).push_opcode(OP_CHECKSIGVERIFY);
                }
                builder = builder.push_x_only_key(last).push_opcode(OP_CHECKSIG);
            }
            MultisigMode::CheckSigAdd => {
                let (first, tail) = self.pubkeys.split_first().expect("checked non-empty");
                builder = builder.push_x_only_key(first).push_opcode(OP_CHECKSIG);
                for pk in tail {
                    builder = builder.push_x_only_key(pk).push_opcode(OP_CHECKSIGADD);
                }
                builder = builder
                    .push_int(self.pubkeys.len() as i64)
                    .push_opcode(OP_NUMEQUAL);
            }
        }
        Ok(builder.into_script())
    }

    pub fn from_script(script: &Script) -> Result<Self, TapscriptError> {
        let instructions = parse_instructions(script)?;
        let params = Self::parse(&instructions)?;
        check_canonical(script, &params.to_script()?)?;
        Ok(params)
    }

    /// Parse either multisig form from an instruction stream.
    fn parse(instructions: &[Instruction]) -> Result<Self, TapscriptError> {
        match instructions.last() {
            Some(Instruction::Op(op)) if *op == OP_NUMEQUAL => Self::parse_checksigadd(instructions),
            Some(Instruction::Op(op)) if *op == OP_CHECKSIG => Self::parse_checksig(instructions),
            _ => Err(TapscriptError::MalformedScript("not a multisig skeleton")),
        }
    }

    /// Parse the CHECKSIG form only (the shape expected after a timelock or
    /// condition prefix).
    fn parse_checksig(instructions: &[Instruction]) -> Result<Self, TapscriptError> {
        if instructions.len() < 2 || instructions.len() % 2 != 0 {
            return Err(TapscriptError::MalformedScript("truncated multisig skeleton"));
        }
        let mut pubkeys = Vec::with_capacity(instructions.len() / 2);
        for (i, pair) in instructions.chunks(2).enumerate() {
            let expected = if i == instructions.len() / 2 - 1 {
                OP_CHECKSIG
            } else {
                OP_CHECKSIGVERIFY
            };
            match pair {
                [key, Instruction::Op(op)] if *op == expected => pubkeys.push(parse_key(key)?),
                _ => return Err(TapscriptError::MalformedScript("broken multisig skeleton")),
            }
        }
        Ok(MultisigParams { pubkeys, mode: MultisigMode::CheckSig })
    }

    fn parse_checksigadd(instructions: &[Instruction]) -> Result<Self, TapscriptError> {
        // <pk1> CHECKSIG (<pk> CHECKSIGADD)* <n> NUMEQUAL
        if instructions.len() < 4 || instructions.len() % 2 != 0 {
            return Err(TapscriptError::MalformedScript("truncated checksigadd skeleton"));
        }
        let body = &instructions[..instructions.len() - 2];
        let mut pubkeys = Vec::with_capacity(body.len() / 2);
        for (i, pair) in body.chunks(2).enumerate() {
            let expected = if i == 0 { OP_CHECKSIG } else { OP_CHECKSIGADD };
            match pair {
                [key, Instruction::Op(op)] if *op == expected => pubkeys.push(parse_key(key)?),
                _ => return Err(TapscriptError::MalformedScript("broken checksigadd skeleton")),
            }
        }
        let count = read_script_num(&instructions[instructions.len() - 2])?;
        if count != pubkeys.len() as i64 {
            return Err(TapscriptError::MalformedScript("checksigadd count mismatch"));
        }
        Ok(MultisigParams { pubkeys, mode: MultisigMode::CheckSigAdd })
    }
}

impl CsvMultisigParams {
    pub fn new(timelock: RelativeTimelock, pubkeys: Vec<XOnlyPublicKey>) -> Self {
        CsvMultisigParams { timelock, pubkeys }
    }

    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        let sequence = self.timelock.to_sequence()?;
        let multisig = MultisigParams {
            pubkeys: self.pubkeys.clone(),
            mode: MultisigMode::CheckSig,
        }
        .to_script()?;
        let builder = Builder::new()
            .push_int(sequence.to_consensus_u32() as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);
        Ok(concat_scripts(builder.into_script(), &multisig))
    }

    pub fn from_script(script: &Script) -> Result<Self, TapscriptError> {
        let instructions = parse_instructions(script)?;
        let params = Self::parse(&instructions)?;
        check_canonical(script, &params.to_script()?)?;
        Ok(params)
    }

    fn parse(instructions: &[Instruction]) -> Result<Self, TapscriptError> {
        let (timelock, rest) = parse_timelock_prefix(instructions, OP_CSV)?;
        let consensus = u32::try_from(timelock)
            .map_err(|_| TapscriptError::MalformedScript("sequence out of range"))?;
        let multisig = MultisigParams::parse_checksig(rest)?;
        Ok(CsvMultisigParams {
            timelock: RelativeTimelock::from_sequence(Sequence::from_consensus(consensus)),
            pubkeys: multisig.pubkeys,
        })
    }
}

impl CltvMultisigParams {
    pub fn new(locktime: u64, pubkeys: Vec<XOnlyPublicKey>) -> Self {
        CltvMultisigParams { locktime, pubkeys }
    }

    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        if self.locktime == 0 {
            return Err(TapscriptError::InvalidParameter("zero absolute timelock"));
        }
        if self.locktime > u32::MAX as u64 {
            return Err(TapscriptError::InvalidParameter("absolute timelock above u32"));
        }
        let multisig = MultisigParams {
            pubkeys: self.pubkeys.clone(),
            mode: MultisigMode::CheckSig,
        }
        .to_script()?;
        let builder = Builder::new()
            .push_int(self.locktime as i64)
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP);
        Ok(concat_scripts(builder.into_script(), &multisig))
    }

    pub fn from_script(script: &Script) -> Result<Self, TapscriptError> {
        let instructions = parse_instructions(script)?;
        let params = Self::parse(&instructions)?;
        check_canonical(script, &params.to_script()?)?;
        Ok(params)
    }

    fn parse(instructions: &[Instruction]) -> Result<Self, TapscriptError> {
        let (locktime, rest) = parse_timelock_prefix(instructions, OP_CLTV)?;
        let multisig = MultisigParams::parse_checksig(rest)?;
        Ok(CltvMultisigParams { locktime: locktime as u64, pubkeys: multisig.pubkeys })
    }
}

impl ConditionMultisigParams {
    pub fn new(condition: ScriptBuf, pubkeys: Vec<XOnlyPublicKey>) -> Self {
        ConditionMultisigParams { condition, pubkeys }
    }

    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        let multisig = MultisigParams {
            pubkeys: self.pubkeys.clone(),
            mode: MultisigMode::CheckSig,
        }
        .to_script()?;
        condition_prefix(&self.condition, &multisig)
    }

    pub fn from_script(script: &Script) -> Result<Self, TapscriptError> {
        let (condition, rest) = split_condition(script)?;
        let instructions = parse_instructions(rest)?;
        let multisig = MultisigParams::parse_checksig(&instructions)?;
        let params = ConditionMultisigParams { condition, pubkeys: multisig.pubkeys };
        check_canonical(script, &params.to_script()?)?;
        Ok(params)
    }
}

impl ConditionCsvMultisigParams {
    pub fn new(
        condition: ScriptBuf,
        timelock: RelativeTimelock,
        pubkeys: Vec<XOnlyPublicKey>,
    ) -> Self {
        ConditionCsvMultisigParams { condition, timelock, pubkeys }
    }

    pub fn to_script(&self) -> Result<ScriptBuf, TapscriptError> {
        let csv = CsvMultisigParams {
            timelock: self.timelock,
            pubkeys: self.pubkeys.clone(),
        }
        .to_script()?;
        condition_prefix(&self.condition, &csv)
    }

    pub fn from_script(script: &Script) -> Result<Self, TapscriptError> {
        let (condition, rest) = split_condition(script)?;
        let instructions = parse_instructions(rest)?;
        let csv = CsvMultisigParams::parse(&instructions)?;
        let params = ConditionCsvMultisigParams {
            condition,
            timelock: csv.timelock,
            pubkeys: csv.pubkeys,
        };
        check_canonical(script, &params.to_script()?)?;
        Ok(params)
    }
}

// --- Parsing helpers ---

fn parse_instructions(script: &Script) -> Result<Vec<Instruction<'_>>, TapscriptError> {
    script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TapscriptError::MalformedScript("unparseable script"))
}

fn parse_key(instruction: &Instruction) -> Result<XOnlyPublicKey, TapscriptError> {
    match instruction {
        Instruction::PushBytes(push) if push.len() == 32 => {
            XOnlyPublicKey::from_slice(push.as_bytes())
                .map_err(|_| TapscriptError::MalformedScript("invalid x-only pubkey"))
        }
        _ => Err(TapscriptError::MalformedScript("expected a 32-byte key push")),
    }
}

/// Read a script number from a single instruction.
///
/// Accepts OP_0, OP_1..OP_16 and raw little-endian pushes up to 8 bytes.
/// Minimality is deliberately not enforced here; the caller's re-encoding
/// comparison rejects non-minimal forms with [`TapscriptError::ReencodingMismatch`].
fn read_script_num(instruction: &Instruction) -> Result<i64, TapscriptError> {
    match instruction {
        Instruction::Op(op) => {
            let byte = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&byte) {
                Ok((byte - OP_PUSHNUM_1.to_u8()) as i64 + 1)
            } else {
                Err(TapscriptError::MalformedScript("expected a numeric push"))
            }
        }
        Instruction::PushBytes(push) => {
            let data = push.as_bytes();
            if data.is_empty() {
                return Ok(0);
            }
            if data.len() > 8 {
                return Err(TapscriptError::MalformedScript("numeric push too long"));
            }
            if data[data.len() - 1] & 0x80 != 0 {
                return Err(TapscriptError::MalformedScript("negative numeric push"));
            }
            let mut value = 0i64;
            for (i, byte) in data.iter().enumerate() {
                value |= (*byte as i64) << (8 * i);
            }
            Ok(value)
        }
    }
}

/// Parse `<number> <op> DROP` and return the number and the remaining
/// instructions.
fn parse_timelock_prefix<'i, 'a>(
    instructions: &'i [Instruction<'a>],
    op: bitcoin::opcodes::Opcode,
) -> Result<(i64, &'i [Instruction<'a>]), TapscriptError> {
    if instructions.len() < 3 {
        return Err(TapscriptError::MalformedScript("truncated timelock prefix"));
    }
    let value = read_script_num(&instructions[0])?;
    match (&instructions[1], &instructions[2]) {
        (Instruction::Op(a), Instruction::Op(b)) if *a == op && *b == OP_DROP => {}
        _ => return Err(TapscriptError::MalformedScript("not a timelock skeleton")),
    }
    Ok((value, &instructions[3..]))
}

/// Split `<condition> VERIFY <rest>` at the last VERIFY in the instruction
/// stream, scanning from the end.
fn split_condition(script: &Script) -> Result<(ScriptBuf, &Script), TapscriptError> {
    let mut verify_at = None;
    for item in script.instruction_indices() {
        let (pos, instruction) =
            item.map_err(|_| TapscriptError::MalformedScript("unparseable script"))?;
        if let Instruction::Op(op) = instruction {
            if op == OP_VERIFY {
                verify_at = Some(pos);
            }
        }
    }
    let pos = verify_at.ok_or(TapscriptError::MalformedScript("no VERIFY split point"))?;
    if pos == 0 {
        return Err(TapscriptError::MalformedScript("empty condition script"));
    }
    let bytes = script.as_bytes();
    let condition = ScriptBuf::from_bytes(bytes[..pos].to_vec());
    let rest = Script::from_bytes(&bytes[pos + 1..]);
    Ok((condition, rest))
}

fn condition_prefix(condition: &Script, rest: &Script) -> Result<ScriptBuf, TapscriptError> {
    if condition.is_empty() {
        return Err(TapscriptError::InvalidParameter("empty condition script"));
    }
    let mut bytes = condition.as_bytes().to_vec();
    bytes.push(OP_VERIFY.to_u8());
    bytes.extend_from_slice(rest.as_bytes());
    Ok(ScriptBuf::from_bytes(bytes))
}

fn concat_scripts(head: ScriptBuf, tail: &Script) -> ScriptBuf {
    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(tail.as_bytes());
    ScriptBuf::from_bytes(bytes)
}

fn check_canonical(input: &Script, reencoded: &Script) -> Result<(), TapscriptError> {
    if input.as_bytes() != reencoded.as_bytes() {
        return Err(TapscriptError::ReencodingMismatch);
    }
    Ok(())
}

//! RFC 1951 (DEFLATE) decompression for the gzip-compressed boot ramdisk.
//!
//! The engine decodes one DEFLATE member in a single pass into a
//! caller-provided output buffer. It is built for the early-boot environment:
//! no allocation, no globals, and all session state carried in per-call
//! values, so independent buffers can be decoded concurrently.
//!
//! The caller is expected to size the output buffer from the decompressed
//! size recorded in the surrounding container (the gzip `ISIZE` trailer).
//! Writes past the end of the buffer are dropped but still counted, and the
//! final [`InflateSummary`] reports whether that happened.
#![no_std]

use bitvec::{field::BitField, order::Lsb0, slice::BitSlice, view::BitView};

/// Decompression error definitions.
///
/// Every error is terminal for the whole call; there is no partial-block
/// recovery. A corrupt ramdisk is unusable, so callers fall back to their
/// alternate boot path rather than resynchronizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflateError {
    /// A stored block's `LEN`/`NLEN` complement check failed.
    InvalidBlockLength,
    /// A decoded symbol or extra-bit lookup fell outside its table, or a
    /// dynamic block's code-length repeat ran past `HLIT + HDIST`.
    InvalidBlockData,
    /// The reserved block type (`BTYPE == 3`) was encountered.
    InvalidEncoding,
    /// A Huffman code-length set violates the Kraft inequality and cannot
    /// form a valid prefix code.
    OversubscribedCode,
    /// The bit cursor would read past the end of the input.
    EndOfInput,
}

/// A bit position inside the compressed input.
///
/// `bit_offset` is always in `0..=7`; advancing past bit 7 moves to the next
/// byte. On success [`inflate_into`] leaves the position just past the final
/// block, which is where a container parser will find its trailer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamPosition {
    pub byte_offset: usize,
    pub bit_offset: u8,
}

impl StreamPosition {
    /// Position at the start of the byte at `byte_offset`.
    pub fn at_byte(byte_offset: usize) -> Self {
        Self { byte_offset, bit_offset: 0 }
    }
}

/// Outcome of a successful decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflateSummary {
    /// Number of bytes the stream decodes to. May exceed the output buffer
    /// length, in which case the surplus bytes were dropped.
    pub written: usize,
    /// Whether any output byte was dropped for lack of buffer capacity.
    pub truncated: bool,
}

/// Decompress the DEFLATE stream in `src`, starting at bit position 0, into
/// `dst`.
pub fn inflate(src: &[u8], dst: &mut [u8]) -> Result<InflateSummary, InflateError> {
    let mut position = StreamPosition::default();
    inflate_into(src, &mut position, dst)
}

/// Decompress the DEFLATE stream in `src`, starting at `position`, into
/// `dst`.
///
/// `position` is updated only on success, so a failed call leaves the
/// caller's cursor untouched.
pub fn inflate_into(
    src: &[u8],
    position: &mut StreamPosition,
    dst: &mut [u8],
) -> Result<InflateSummary, InflateError> {
    debug_assert!(position.bit_offset < 8);
    let mut decoder = Decoder {
        cursor: BitCursor::new(src, position.byte_offset * 8 + position.bit_offset as usize),
        sink: OutputSink::new(dst),
    };
    decoder.run()?;
    *position = decoder.cursor.position();
    Ok(InflateSummary { written: decoder.sink.position, truncated: decoder.sink.truncated() })
}

//Alphabet sizes fixed by RFC 1951.
const LITERAL_LENGTH_SYMBOLS: usize = 288;
const DISTANCE_SYMBOLS: usize = 32;
const CODE_LENGTH_SYMBOLS: usize = 19;

const MAX_CODE_LENGTH: usize = 15;
const END_OF_BLOCK: usize = 256;

//Extra-bit widths and base values for the length codes 257..=285.
const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
const LENGTH_BASE: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

//Extra-bit widths and base values for the distance codes 0..=29.
const DISTANCE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];
const DISTANCE_BASE: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

//Transmission order of the code-length code lengths in a dynamic block.
const CODE_LENGTH_ORDER: [usize; 19] =
    [16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15];

/// Cursor over the compressed input bitstream.
///
/// DEFLATE consumes bits within each byte starting at the least-significant
/// bit, so the input is viewed as an `Lsb0` bit slice with a linear index.
/// The two multi-bit read primitives consume bits identically and differ
/// only in how the consumed bits are assembled into a value.
struct BitCursor<'a> {
    bytes: &'a [u8],
    bits: &'a BitSlice<u8, Lsb0>,
    index: usize,
}

impl<'a> BitCursor<'a> {
    fn new(bytes: &'a [u8], index: usize) -> Self {
        Self { bytes, bits: bytes.view_bits::<Lsb0>(), index }
    }

    // Consumes one bit; reading past the end of the input is an error.
    fn read_bit(&mut self) -> Result<bool, InflateError> {
        match self.bits.get(self.index) {
            Some(bit) => {
                self.index += 1;
                Ok(*bit)
            }
            None => Err(InflateError::EndOfInput),
        }
    }

    // Reads `count` bits, first bit consumed becoming the most significant
    // bit of the result. This is the order in which Huffman code values are
    // laid out in the stream.
    fn read_bits_msb_first(&mut self, count: usize) -> Result<usize, InflateError> {
        let mut value = 0;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()? as usize;
        }
        Ok(value)
    }

    // Reads `count` bits, first bit consumed becoming the least significant
    // bit of the result. All multi-bit header and extra-bit fields use this
    // order per RFC 1951.
    fn read_bits_lsb_first(&mut self, count: usize) -> Result<usize, InflateError> {
        if count == 0 {
            return Ok(0);
        }
        if let Some(bitslice) = self.bits.get(self.index..self.index + count) {
            self.index += count;
            Ok(bitslice.load_le::<usize>())
        } else {
            Err(InflateError::EndOfInput)
        }
    }

    // Discards the remaining bits of the current byte, if any.
    fn align_to_byte(&mut self) {
        self.index = (self.index + 7) & !7;
    }

    // Reads a 16-bit little-endian value from a byte-aligned position. The
    // wire format fixes the byte order; the host's does not matter.
    fn read_u16_le(&mut self) -> Result<u16, InflateError> {
        debug_assert!(self.index % 8 == 0);
        let byte = self.index / 8;
        if let Some(raw) = self.bytes.get(byte..byte + 2) {
            self.index += 16;
            Ok(u16::from_le_bytes([raw[0], raw[1]]))
        } else {
            Err(InflateError::EndOfInput)
        }
    }

    // Reads `count` raw bytes from a byte-aligned position.
    fn read_bytes(&mut self, count: usize) -> Result<&'a [u8], InflateError> {
        debug_assert!(self.index % 8 == 0);
        let start = self.index / 8;
        if let Some(raw) = self.bytes.get(start..start + count) {
            self.index += count * 8;
            Ok(raw)
        } else {
            Err(InflateError::EndOfInput)
        }
    }

    fn position(&self) -> StreamPosition {
        StreamPosition { byte_offset: self.index / 8, bit_offset: (self.index % 8) as u8 }
    }
}

// Computes the first canonical code value for each code length, per
// RFC 1951 section 3.2.2. Symbols of equal length then take consecutive
// code values in ascending symbol order; that tie-break is what makes the
// assignment canonical and is required for interoperability.
//
// Callers must have validated that every length is <= MAX_CODE_LENGTH.
const fn first_codes(lengths: &[u8]) -> [u32; MAX_CODE_LENGTH + 1] {
    let mut count = [0u32; MAX_CODE_LENGTH + 1];
    let mut symbol = 0;
    while symbol < lengths.len() {
        count[lengths[symbol] as usize] += 1;
        symbol += 1;
    }
    // zero-length symbols are unused and carry no code.
    count[0] = 0;

    let mut first = [0u32; MAX_CODE_LENGTH + 1];
    let mut code = 0u32;
    let mut length = 1;
    while length <= MAX_CODE_LENGTH {
        code = (code + count[length - 1]) << 1;
        first[length] = code;
        length += 1;
    }
    first
}

const MAX_TABLE_SLOTS: usize = 2 * (LITERAL_LENGTH_SYMBOLS - 1);

// Slot value marking an unassigned trie slot. Never produced by a valid
// build: terminals are < alphabet and node pointers are < 2 * alphabet - 1.
const VACANT: u16 = u16::MAX;

/// Huffman decode table: a flat binary trie with two child slots per
/// internal node.
///
/// Node `n` owns slots `2n` and `2n + 1`. A slot value below `alphabet` is a
/// terminal symbol; otherwise it points at node `value - alphabet`. Tables
/// are transient: rebuilt per dynamic block, or compiled once at const time
/// for the two fixed-Huffman tables.
struct DecodeTable {
    slots: [u16; MAX_TABLE_SLOTS],
    alphabet: usize,
}

impl DecodeTable {
    /// Compiles the decode table for a canonical Huffman code given one code
    /// length per symbol (0 = unused).
    ///
    /// Each coded symbol is inserted by walking its code value bit by bit
    /// (MSB first) from the root, allocating internal nodes on demand. A set
    /// of lengths that overfills the code space is rejected with
    /// [`InflateError::OversubscribedCode`]: letting such a table through
    /// would at best surface later as an unrelated decode error, and at
    /// worst decode silently to garbage.
    const fn compile(lengths: &[u8], alphabet: usize) -> Result<Self, InflateError> {
        debug_assert!(lengths.len() <= alphabet && alphabet <= LITERAL_LENGTH_SYMBOLS);

        let mut symbol = 0;
        while symbol < lengths.len() {
            if lengths[symbol] as usize > MAX_CODE_LENGTH {
                return Err(InflateError::InvalidBlockData);
            }
            symbol += 1;
        }

        let mut next_code = first_codes(lengths);
        let mut slots = [VACANT; MAX_TABLE_SLOTS];
        // node 0 is the root; internal nodes are capped by the slot count.
        let mut node_count = 1;

        let mut symbol = 0;
        while symbol < lengths.len() {
            let length = lengths[symbol] as usize;
            if length == 0 {
                symbol += 1;
                continue;
            }
            let code = next_code[length];
            next_code[length] += 1;

            let mut node = 0;
            let mut depth = length;
            while depth > 0 {
                depth -= 1;
                let bit = ((code >> depth) & 1) as usize;
                let slot = 2 * node + bit;
                let entry = slots[slot];
                if depth == 0 {
                    if entry != VACANT {
                        return Err(InflateError::OversubscribedCode);
                    }
                    slots[slot] = symbol as u16;
                } else if entry == VACANT {
                    if node_count + 1 >= alphabet {
                        return Err(InflateError::OversubscribedCode);
                    }
                    slots[slot] = (alphabet + node_count) as u16;
                    node = node_count;
                    node_count += 1;
                } else if entry as usize >= alphabet {
                    node = entry as usize - alphabet;
                } else {
                    // this code's path runs through an already-placed leaf.
                    return Err(InflateError::OversubscribedCode);
                }
            }
            symbol += 1;
        }
        Ok(Self { slots, alphabet })
    }

    /// Decodes one symbol by walking the trie one input bit at a time.
    fn decode(&self, cursor: &mut BitCursor) -> Result<usize, InflateError> {
        let mut node = 0;
        loop {
            let slot = 2 * node + cursor.read_bit()? as usize;
            let entry = self.slots[slot];
            if entry == VACANT {
                // the stream selected a code that was never assigned
                // (possible with an incomplete code set).
                Err(InflateError::InvalidBlockData)?;
            }
            if (entry as usize) < self.alphabet {
                return Ok(entry as usize);
            }
            node = entry as usize - self.alphabet;
        }
    }
}

// Code lengths of the fixed literal/length alphabet, RFC 1951 section 3.2.6.
const fn fixed_literal_length_lengths() -> [u8; LITERAL_LENGTH_SYMBOLS] {
    let mut lengths = [8u8; LITERAL_LENGTH_SYMBOLS];
    let mut symbol = 144;
    while symbol < 256 {
        lengths[symbol] = 9;
        symbol += 1;
    }
    let mut symbol = 256;
    while symbol < 280 {
        lengths[symbol] = 7;
        symbol += 1;
    }
    lengths
}

// The fixed-Huffman tables are constants of the format, so they are compiled
// once into the binary instead of being rebuilt on every fixed block.
const FIXED_LITERAL_LENGTH_TABLE: DecodeTable =
    match DecodeTable::compile(&fixed_literal_length_lengths(), LITERAL_LENGTH_SYMBOLS) {
        Ok(table) => table,
        Err(_) => panic!("fixed literal/length table failed to compile"),
    };

const FIXED_DISTANCE_TABLE: DecodeTable =
    match DecodeTable::compile(&[5u8; DISTANCE_SYMBOLS], DISTANCE_SYMBOLS) {
        Ok(table) => table,
        Err(_) => panic!("fixed distance table failed to compile"),
    };

/// Capacity-bounded output buffer with an explicit write cursor.
///
/// `position` keeps advancing when the buffer is full; the dropped bytes are
/// only counted. This preserves the boot-time contract of "decompress
/// exactly N known bytes" while still letting the caller detect an
/// under-sized buffer from the summary.
struct OutputSink<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> OutputSink<'a> {
    fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    fn push(&mut self, byte: u8) {
        if self.position < self.buffer.len() {
            self.buffer[self.position] = byte;
        }
        self.position += 1;
    }

    // Expands an LZ77 back-reference by copying `length` bytes from
    // `distance` bytes behind the write cursor. The copy runs byte by byte:
    // when `distance < length` the source window overlaps bytes produced by
    // this very call, and each of them must be visible to later iterations.
    fn copy_back_reference(&mut self, length: usize, distance: usize) -> Result<(), InflateError> {
        if distance == 0 || distance > self.position {
            Err(InflateError::InvalidBlockData)?;
        }
        let start = self.position - distance;
        for source in start..start + length {
            // a source byte past the buffer end was itself dropped; keep
            // counting without touching memory.
            let byte = self.buffer.get(source).copied().unwrap_or(0);
            self.push(byte);
        }
        Ok(())
    }

    fn truncated(&self) -> bool {
        self.position > self.buffer.len()
    }
}

/// Top-level block processor. Holds the whole decode session: the bit cursor
/// and the output sink persist across blocks, per-block trees and tables are
/// rebuilt as needed.
struct Decoder<'a, 'b> {
    cursor: BitCursor<'a>,
    sink: OutputSink<'b>,
}

impl Decoder<'_, '_> {
    // Reads block headers and dispatches on the block type until the final
    // block completes or an error terminates the session.
    fn run(&mut self) -> Result<(), InflateError> {
        loop {
            let is_final = self.cursor.read_bits_msb_first(1)? == 1;
            let block_type = self.cursor.read_bits_lsb_first(2)?;
            log::trace!("block header: final={} type={}", is_final, block_type);
            match block_type {
                0 => self.stored_block()?,
                1 => self.huffman_block(&FIXED_LITERAL_LENGTH_TABLE, &FIXED_DISTANCE_TABLE)?,
                2 => self.dynamic_block()?,
                _ => Err(InflateError::InvalidEncoding)?,
            }
            if is_final {
                break;
            }
        }
        log::trace!("inflate done: {} bytes of output", self.sink.position);
        Ok(())
    }

    // Stored block: byte-aligned length-prefixed raw data.
    fn stored_block(&mut self) -> Result<(), InflateError> {
        self.cursor.align_to_byte();
        let len = self.cursor.read_u16_le()? as usize;
        let nlen = self.cursor.read_u16_le()? as usize;
        if len + nlen != 0xFFFF {
            Err(InflateError::InvalidBlockLength)?;
        }
        log::trace!("stored block: {} bytes", len);
        for &byte in self.cursor.read_bytes(len)? {
            self.sink.push(byte);
        }
        Ok(())
    }

    // Dynamic block: the two alphabets' code lengths are themselves Huffman
    // coded with the code-length alphabet, whose lengths come first in a
    // fixed permutation order.
    fn dynamic_block(&mut self) -> Result<(), InflateError> {
        let hlit = self.cursor.read_bits_lsb_first(5)? + 257;
        let hdist = self.cursor.read_bits_lsb_first(5)? + 1;
        let hclen = self.cursor.read_bits_lsb_first(4)? + 4;
        log::trace!("dynamic block: hlit={} hdist={} hclen={}", hlit, hdist, hclen);

        let mut code_length_lengths = [0u8; CODE_LENGTH_SYMBOLS];
        for &position in CODE_LENGTH_ORDER.iter().take(hclen) {
            code_length_lengths[position] = self.cursor.read_bits_lsb_first(3)? as u8;
        }
        let code_length_table =
            DecodeTable::compile(&code_length_lengths, CODE_LENGTH_SYMBOLS)?;

        // literal/length and distance code lengths form one run so a repeat
        // may cross from one alphabet into the other.
        let mut lengths = [0u8; LITERAL_LENGTH_SYMBOLS + DISTANCE_SYMBOLS];
        let total = hlit + hdist;
        let mut index = 0;
        while index < total {
            let symbol = code_length_table.decode(&mut self.cursor)?;
            let (fill, repeat) = match symbol {
                0..=15 => {
                    lengths[index] = symbol as u8;
                    index += 1;
                    continue;
                }
                16 => {
                    if index == 0 {
                        // nothing to repeat yet.
                        Err(InflateError::InvalidBlockData)?;
                    }
                    (lengths[index - 1], 3 + self.cursor.read_bits_lsb_first(2)?)
                }
                17 => (0, 3 + self.cursor.read_bits_lsb_first(3)?),
                18 => (0, 11 + self.cursor.read_bits_lsb_first(7)?),
                _ => return Err(InflateError::InvalidBlockData),
            };
            if index + repeat > total {
                Err(InflateError::InvalidBlockData)?;
            }
            let mut count = repeat;
            while count > 0 {
                lengths[index] = fill;
                index += 1;
                count -= 1;
            }
        }

        let literal_length_table = DecodeTable::compile(&lengths[..hlit], hlit)?;
        let distance_table = DecodeTable::compile(&lengths[hlit..total], hdist)?;
        self.huffman_block(&literal_length_table, &distance_table)
    }

    // Symbol loop shared by the fixed and dynamic block types: literals go
    // straight to the sink, length codes pull a distance code and expand a
    // back-reference, symbol 256 ends the block.
    fn huffman_block(
        &mut self,
        literal_length: &DecodeTable,
        distance: &DecodeTable,
    ) -> Result<(), InflateError> {
        loop {
            let symbol = literal_length.decode(&mut self.cursor)?;
            if symbol < END_OF_BLOCK {
                self.sink.push(symbol as u8);
                continue;
            }
            if symbol == END_OF_BLOCK {
                return Ok(());
            }

            let length_code = symbol - (END_OF_BLOCK + 1);
            if length_code >= LENGTH_BASE.len() {
                // symbols 286 and 287 have no meaning in a compressed block.
                Err(InflateError::InvalidBlockData)?;
            }
            let length = LENGTH_BASE[length_code] as usize
                + self.cursor.read_bits_lsb_first(LENGTH_EXTRA_BITS[length_code] as usize)?;

            let distance_code = distance.decode(&mut self.cursor)?;
            if distance_code >= DISTANCE_BASE.len() {
                Err(InflateError::InvalidBlockData)?;
            }
            let back_distance = DISTANCE_BASE[distance_code] as usize
                + self.cursor.read_bits_lsb_first(DISTANCE_EXTRA_BITS[distance_code] as usize)?;

            self.sink.copy_back_reference(length, back_distance)?;
        }
    }
}

//! Tile-compressed images stored in binary table extensions.
//!
//! Survey stacks are often shipped with the image cut into rectangular
//! tiles, each compressed into one row of a `BINTABLE` marked `ZIMAGE = T`.
//! Floating point images are quantized to integers first, with a per-tile
//! `ZSCALE` and `ZZERO`, optionally dithered by a fixed pseudo-random
//! sequence so the quantization noise averages out.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::OnceLock;

use flate2::read::GzDecoder;
use ndarray::{Array2, s};
use tracing::debug;

use super::rice;

const BLOCK_LEN: u64 = 2880;
const CARD_LEN: usize = 80;

/// Quantized value of a NaN pixel when the header names no `ZBLANK`.
const NULL_VALUE: i64 = -2_147_483_647;
/// Quantized value of an exact zero under `SUBTRACTIVE_DITHER_2`.
const ZERO_VALUE: i64 = -2_147_483_646;
const RANDOM_COUNT: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Keyword values of one HDU header, in card order.
#[derive(Debug, Clone, Default)]
pub(crate) struct Header {
    cards: Vec<(String, Value)>,
}

impl Header {
    fn get(&self, key: &str) -> Option<&Value> {
        self.cards.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    fn int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    fn float(&self, key: &str) -> Option<f64> {
        match self.get(key) {
            Some(Value::Integer(v)) => Some(*v as f64),
            Some(Value::Float(v)) => Some(*v),
            _ => None,
        }
    }

    fn text(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Text(v)) => Some(v),
            _ => None,
        }
    }

    fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some(Value::Logical(true)))
    }

    fn required(&self, key: &str) -> io::Result<i64> {
        self.int(key)
            .ok_or_else(|| invalid(format!("missing integer keyword {key}")))
    }

    fn dimension(&self, key: &str) -> io::Result<usize> {
        let value = self.required(key)?;
        usize::try_from(value).map_err(|_| invalid(format!("{key} = {value} is negative")))
    }
}

/// Where the first HDU with pixels lives.
#[derive(Debug)]
pub(crate) enum ImageHdu {
    /// A primary array or `IMAGE` extension.
    Plain,
    /// A tile-compressed image whose table starts at `data_start`.
    TileCompressed { header: Header, data_start: u64 },
}

/// Walk the HDU headers and report the first one holding an image.
pub(crate) fn locate_image<R: Read + Seek>(r: &mut R) -> io::Result<Option<ImageHdu>> {
    let end = r.seek(SeekFrom::End(0))?;
    let mut offset = 0;
    while offset < end {
        r.seek(SeekFrom::Start(offset))?;
        let (header, header_len) = read_header(r)?;
        let data_start = offset + header_len;

        let xtension = header.text("XTENSION");
        let is_array = offset == 0 || xtension == Some("IMAGE");
        if is_array && has_pixels(&header) {
            return Ok(Some(ImageHdu::Plain));
        }
        if xtension == Some("BINTABLE") && header.flag("ZIMAGE") {
            return Ok(Some(ImageHdu::TileCompressed { header, data_start }));
        }

        let skip = data_len(&header)?.div_ceil(BLOCK_LEN) * BLOCK_LEN;
        offset = data_start
            .checked_add(skip)
            .ok_or_else(|| invalid("HDU data size overflows"))?;
    }
    Ok(None)
}

/// Decode the tile-compressed image described by `header`.
pub(crate) fn read_tile_compressed<R: Read + Seek>(
    r: &mut R,
    header: &Header,
    data_start: u64,
) -> io::Result<Array2<f32>> {
    let image = TiledImage::from_header(header)?;
    let table = Table::from_header(header)?;

    let pcount = header.int("PCOUNT").unwrap_or(0);
    let heap_len =
        usize::try_from(pcount).map_err(|_| invalid(format!("PCOUNT = {pcount} is negative")))?;
    let len = table
        .row_len
        .checked_mul(table.rows)
        .and_then(|n| n.checked_add(heap_len))
        .ok_or_else(|| invalid("table size overflows"))?;
    let end = r.seek(SeekFrom::End(0))?;
    if data_start.saturating_add(len as u64) > end {
        return Err(invalid("compressed table extends past the end of the file"));
    }

    let mut data = vec![0u8; len];
    r.seek(SeekFrom::Start(data_start))?;
    r.read_exact(&mut data)?;

    let pixels = image.decode(&table, &data)?;
    debug!(tiles = table.rows, codec = ?image.codec, "decoded image tiles");
    Ok(pixels)
}

fn read_header<R: Read>(r: &mut R) -> io::Result<(Header, u64)> {
    let mut header = Header::default();
    let mut block = [0u8; BLOCK_LEN as usize];
    let mut len = 0;
    loop {
        r.read_exact(&mut block)?;
        len += BLOCK_LEN;
        for card in block.chunks_exact(CARD_LEN) {
            let key = String::from_utf8_lossy(&card[..8]).trim_end().to_string();
            if key == "END" {
                return Ok((header, len));
            }
            if &card[8..10] == b"= " {
                if let Some(value) = parse_value(&String::from_utf8_lossy(&card[10..])) {
                    header.cards.push((key, value));
                }
            }
        }
    }
}

/// Value field of a card, without its trailing comment.
fn parse_value(field: &str) -> Option<Value> {
    let field = field.trim_start();
    if let Some(rest) = field.strip_prefix('\'') {
        let mut text = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '\'' {
                text.push(c);
            } else if chars.peek() == Some(&'\'') {
                chars.next();
                text.push('\'');
            } else {
                return Some(Value::Text(text.trim_end().to_string()));
            }
        }
        return None;
    }

    let token = field.split('/').next()?.trim();
    match token {
        "" => None,
        "T" => Some(Value::Logical(true)),
        "F" => Some(Value::Logical(false)),
        _ => token.parse().map(Value::Integer).ok().or_else(|| {
            token
                .replace(|c: char| c == 'D' || c == 'd', "E")
                .parse()
                .map(Value::Float)
                .ok()
        }),
    }
}

fn has_pixels(header: &Header) -> bool {
    header.int("NAXIS").is_some_and(|n| n >= 2)
        && header.int("NAXIS1").is_some_and(|n| n > 0)
        && header.int("NAXIS2").is_some_and(|n| n > 0)
}

/// Bytes of data after a header, before block padding.
fn data_len(header: &Header) -> io::Result<u64> {
    let bitpix = header.required("BITPIX")?;
    let naxis = header.dimension("NAXIS")?;
    if naxis == 0 {
        return Ok(0);
    }
    let overflow = || invalid("HDU data size overflows");

    let mut elements: u64 = 1;
    for i in 1..=naxis {
        let n = header.dimension(&format!("NAXIS{i}"))? as u64;
        elements = elements.checked_mul(n).ok_or_else(overflow)?;
    }
    let pcount = u64::try_from(header.int("PCOUNT").unwrap_or(0))
        .map_err(|_| invalid("negative PCOUNT"))?;
    let gcount = u64::try_from(header.int("GCOUNT").unwrap_or(1))
        .map_err(|_| invalid("negative GCOUNT"))?;

    pcount
        .checked_add(elements)
        .and_then(|n| n.checked_mul(gcount))
        .and_then(|n| n.checked_mul(bitpix.unsigned_abs()))
        .map(|bits| bits / 8)
        .ok_or_else(overflow)
}

#[derive(Debug, Clone, Copy)]
enum Field {
    /// Variable-length array descriptor (`P`, or `Q` when wide) and the
    /// element code of the heap data it points at.
    Descriptor { wide: bool, element: u8 },
    Scalar(u8),
}

#[derive(Debug)]
struct Column {
    name: String,
    offset: usize,
    field: Field,
}

/// Row layout of a binary table and the start of its heap.
#[derive(Debug)]
struct Table {
    row_len: usize,
    rows: usize,
    heap_start: usize,
    columns: Vec<Column>,
}

impl Table {
    fn from_header(header: &Header) -> io::Result<Self> {
        let row_len = header.dimension("NAXIS1")?;
        let rows = header.dimension("NAXIS2")?;
        let fields = header.dimension("TFIELDS")?;

        let mut columns = Vec::new();
        let mut offset = 0;
        for i in 1..=fields {
            let tform = header
                .text(&format!("TFORM{i}"))
                .ok_or_else(|| invalid(format!("missing TFORM{i}")))?;
            let (width, field) = parse_tform(tform)?;
            let name = header
                .text(&format!("TTYPE{i}"))
                .unwrap_or_default()
                .to_ascii_uppercase();
            columns.push(Column { name, offset, field });
            offset += width;
        }
        if offset != row_len {
            return Err(invalid(format!(
                "columns span {offset} bytes but rows are {row_len}"
            )));
        }

        let main_len = row_len
            .checked_mul(rows)
            .ok_or_else(|| invalid("table size overflows"))?;
        let heap_start = match header.int("THEAP") {
            Some(theap) => usize::try_from(theap).map_err(|_| invalid("negative THEAP"))?,
            None => main_len,
        };

        Ok(Self {
            row_len,
            rows,
            heap_start,
            columns,
        })
    }

    fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn cell<'a>(
        &self,
        data: &'a [u8],
        row: usize,
        column: &Column,
        len: usize,
    ) -> io::Result<&'a [u8]> {
        let start = row * self.row_len + column.offset;
        data.get(start..start + len)
            .ok_or_else(|| invalid(format!("row {row} lies past the end of the table")))
    }

    /// Heap bytes referenced by a descriptor cell.
    fn heap<'a>(&self, data: &'a [u8], row: usize, column: &Column) -> io::Result<&'a [u8]> {
        let Field::Descriptor { wide, element } = column.field else {
            return Err(invalid(format!("column {} is not variable-length", column.name)));
        };
        let (count, offset) = if wide {
            let b = self.cell(data, row, column, 16)?;
            (be_uint(&b[..8]), be_uint(&b[8..]))
        } else {
            let b = self.cell(data, row, column, 8)?;
            (be_uint(&b[..4]), be_uint(&b[4..]))
        };

        let range = usize::try_from(count)
            .ok()
            .zip(element_width(element))
            .and_then(|(count, width)| count.checked_mul(width))
            .zip(usize::try_from(offset).ok())
            .and_then(|(len, offset)| {
                let start = self.heap_start.checked_add(offset)?;
                Some(start..start.checked_add(len)?)
            });
        range
            .and_then(|range| data.get(range))
            .ok_or_else(|| invalid(format!("row {row} {} points outside the heap", column.name)))
    }

    fn scalar(&self, data: &[u8], row: usize, column: &Column) -> io::Result<f64> {
        let Field::Scalar(code) = column.field else {
            return Err(invalid(format!("column {} is not a scalar", column.name)));
        };
        let width = element_width(code)
            .ok_or_else(|| invalid(format!("column {} is not numeric", column.name)))?;
        let raw = be_uint(self.cell(data, row, column, width)?);
        Ok(match code {
            b'D' => f64::from_bits(raw),
            b'E' => f64::from(f32::from_bits(raw as u32)),
            b'I' => f64::from(raw as u16 as i16),
            b'J' => f64::from(raw as u32 as i32),
            b'K' => raw as i64 as f64,
            _ => raw as f64,
        })
    }
}

/// Byte width and kind of a `TFORMn` value such as `1PB(2048)` or `1D`.
fn parse_tform(tform: &str) -> io::Result<(usize, Field)> {
    let bad = || invalid(format!("unsupported column format {tform:?}"));
    let tform = tform.trim();
    let digits = tform.bytes().take_while(u8::is_ascii_digit).count();
    let repeat = if digits == 0 {
        1
    } else {
        tform[..digits].parse::<usize>().map_err(|_| bad())?
    };

    let mut codes = tform[digits..].bytes().map(|b| b.to_ascii_uppercase());
    let code = codes.next().ok_or_else(bad)?;
    let (unit, field) = match code {
        b'P' | b'Q' => {
            let element = codes.next().ok_or_else(bad)?;
            element_width(element).ok_or_else(bad)?;
            let wide = code == b'Q';
            (if wide { 16 } else { 8 }, Field::Descriptor { wide, element })
        }
        b'X' => return Ok((repeat.div_ceil(8), Field::Scalar(code))),
        b'C' => (8, Field::Scalar(code)),
        b'M' => (16, Field::Scalar(code)),
        _ => (element_width(code).ok_or_else(bad)?, Field::Scalar(code)),
    };
    repeat
        .checked_mul(unit)
        .map(|width| (width, field))
        .ok_or_else(bad)
}

fn element_width(code: u8) -> Option<usize> {
    match code {
        b'L' | b'B' | b'A' => Some(1),
        b'I' => Some(2),
        b'J' | b'E' => Some(4),
        b'K' | b'D' => Some(8),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Codec {
    Rice { block_size: usize, bytepix: usize },
    Gzip { shuffled: bool },
    Uncompressed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Dither {
    None,
    Subtractive1,
    Subtractive2,
}

/// Image-level parameters of a tile-compressed HDU.
#[derive(Debug)]
struct TiledImage {
    width: usize,
    height: usize,
    tile_width: usize,
    tile_height: usize,
    zbitpix: i64,
    codec: Codec,
    dither: Dither,
    dither_seed: i64,
    blank: Option<i64>,
    scale: Option<f64>,
    zero: Option<f64>,
    bscale: f64,
    bzero: f64,
}

/// Columns a tile may be stored in.
struct TileColumns<'t> {
    compressed: &'t Column,
    gzip: Option<&'t Column>,
    uncompressed: Option<&'t Column>,
    scale: Option<&'t Column>,
    zero: Option<&'t Column>,
    blank: Option<&'t Column>,
}

impl TiledImage {
    fn from_header(header: &Header) -> io::Result<Self> {
        let zbitpix = header.required("ZBITPIX")?;
        if ![8, 16, 32, 64, -32, -64].contains(&zbitpix) {
            return Err(invalid(format!("unsupported ZBITPIX {zbitpix}")));
        }

        let znaxis = header.dimension("ZNAXIS")?;
        if znaxis < 2 {
            return Err(invalid(format!("ZNAXIS = {znaxis}, expected a 2-D image")));
        }
        for i in 3..=znaxis {
            if header.dimension(&format!("ZNAXIS{i}"))? != 1 {
                return Err(invalid("image cubes are not supported"));
            }
        }
        let width = header.dimension("ZNAXIS1")?;
        let height = header.dimension("ZNAXIS2")?;
        let tile_width = match header.int("ZTILE1") {
            Some(_) => header.dimension("ZTILE1")?,
            None => width,
        };
        let tile_height = match header.int("ZTILE2") {
            Some(_) => header.dimension("ZTILE2")?,
            None => 1,
        };
        if width == 0 || height == 0 || tile_width == 0 || tile_height == 0 {
            return Err(invalid("empty image or tile"));
        }

        let mut block_size = rice::DEFAULT_BLOCK_SIZE;
        let mut bytepix = match zbitpix {
            8 => 1,
            16 => 2,
            _ => 4,
        };
        for i in 1.. {
            let Some(name) = header.text(&format!("ZNAME{i}")) else {
                break;
            };
            let value = header.int(&format!("ZVAL{i}"));
            let Some(value) = value else { continue };
            let value = usize::try_from(value)
                .map_err(|_| invalid(format!("{name} = {value} is negative")))?;
            match name {
                "BLOCKSIZE" => block_size = value,
                "BYTEPIX" => bytepix = value,
                _ => {}
            }
        }

        let codec = match header.text("ZCMPTYPE") {
            Some("RICE_1" | "RICE_ONE") => Codec::Rice {
                block_size,
                bytepix,
            },
            Some("GZIP_1") => Codec::Gzip { shuffled: false },
            Some("GZIP_2") => Codec::Gzip { shuffled: true },
            Some("NOCOMPRESS") => Codec::Uncompressed,
            Some(other) => return Err(invalid(format!("unsupported tile compression {other}"))),
            None => return Err(invalid("missing ZCMPTYPE")),
        };

        let dither = match header.text("ZQUANTIZ") {
            None | Some("NO_DITHER") => Dither::None,
            Some("SUBTRACTIVE_DITHER_1") => Dither::Subtractive1,
            Some("SUBTRACTIVE_DITHER_2") => Dither::Subtractive2,
            Some(other) => return Err(invalid(format!("unsupported quantization {other}"))),
        };

        let blank = header
            .int("ZBLANK")
            .or_else(|| if zbitpix > 0 { header.int("BLANK") } else { None });

        Ok(Self {
            width,
            height,
            tile_width,
            tile_height,
            zbitpix,
            codec,
            dither,
            dither_seed: header.int("ZDITHER0").unwrap_or(1),
            blank,
            scale: header.float("ZSCALE"),
            zero: header.float("ZZERO"),
            bscale: header.float("BSCALE").unwrap_or(1.0),
            bzero: header.float("BZERO").unwrap_or(0.0),
        })
    }

    fn decode(&self, table: &Table, data: &[u8]) -> io::Result<Array2<f32>> {
        let tiles_x = self.width.div_ceil(self.tile_width);
        let tiles_y = self.height.div_ceil(self.tile_height);
        if tiles_x * tiles_y != table.rows {
            return Err(invalid(format!(
                "{} table rows for {tiles_x}x{tiles_y} tiles",
                table.rows
            )));
        }

        let columns = TileColumns {
            compressed: table
                .column("COMPRESSED_DATA")
                .ok_or_else(|| invalid("missing COMPRESSED_DATA column"))?,
            gzip: table.column("GZIP_COMPRESSED_DATA"),
            uncompressed: table.column("UNCOMPRESSED_DATA"),
            scale: table.column("ZSCALE"),
            zero: table.column("ZZERO"),
            blank: table.column("ZBLANK"),
        };

        let mut image = Array2::from_elem((self.height, self.width), f32::NAN);
        for row in 0..table.rows {
            let x0 = (row % tiles_x) * self.tile_width;
            let y0 = (row / tiles_x) * self.tile_height;
            let w = self.tile_width.min(self.width - x0);
            let h = self.tile_height.min(self.height - y0);

            let pixels = self.decode_tile(table, &columns, data, row, w * h)?;
            // Tiles hold their rows in order, first axis fastest.
            let mut tile = image.slice_mut(s![y0..y0 + h, x0..x0 + w]);
            for (dst, src) in tile.iter_mut().zip(pixels) {
                *dst = src;
            }
        }
        Ok(image)
    }

    fn decode_tile(
        &self,
        table: &Table,
        columns: &TileColumns,
        data: &[u8],
        row: usize,
        len: usize,
    ) -> io::Result<Vec<f32>> {
        let bytes = table.heap(data, row, columns.compressed)?;
        if bytes.is_empty() {
            return self.lossless_tile(table, columns, data, row, len);
        }

        let scaling = self.tile_scaling(table, columns, data, row)?;
        if self.zbitpix < 0 && scaling.is_none() {
            let width = (self.zbitpix.unsigned_abs() / 8) as usize;
            let raw = match self.codec {
                Codec::Gzip { shuffled } => {
                    let raw = gunzip(bytes)?;
                    if shuffled { unshuffle(&raw, width) } else { raw }
                }
                Codec::Uncompressed => bytes.to_vec(),
                Codec::Rice { .. } => {
                    return Err(invalid("Rice tiles of a float image need ZSCALE and ZZERO"));
                }
            };
            return floats(&raw, self.zbitpix, len);
        }

        // Quantized floats are stored as 32-bit integers.
        let width = if self.zbitpix < 0 { 4 } else { (self.zbitpix / 8) as usize };
        let values: Vec<i64> = match self.codec {
            Codec::Rice {
                block_size,
                bytepix,
            } => rice::decode(bytes, len, bytepix, block_size)?
                .into_iter()
                .map(i64::from)
                .collect(),
            Codec::Gzip { shuffled } => {
                let raw = gunzip(bytes)?;
                let raw = if shuffled { unshuffle(&raw, width) } else { raw };
                integers(&raw, width, len)?
            }
            Codec::Uncompressed => integers(bytes, width, len)?,
        };

        let blank = match columns.blank {
            Some(column) => Some(table.scalar(data, row, column)? as i64),
            None => self.blank,
        };
        Ok(match scaling {
            Some((scale, zero)) => {
                self.dequantize(&values, row, scale, zero, blank.unwrap_or(NULL_VALUE))
            }
            None => values
                .iter()
                .map(|&v| {
                    if Some(v) == blank {
                        f32::NAN
                    } else {
                        (v as f64 * self.bscale + self.bzero) as f32
                    }
                })
                .collect(),
        })
    }

    /// `(ZSCALE, ZZERO)` of a quantized float tile.
    fn tile_scaling(
        &self,
        table: &Table,
        columns: &TileColumns,
        data: &[u8],
        row: usize,
    ) -> io::Result<Option<(f64, f64)>> {
        if self.zbitpix > 0 {
            return Ok(None);
        }
        let scale = match columns.scale {
            Some(column) => Some(table.scalar(data, row, column)?),
            None => self.scale,
        };
        let zero = match columns.zero {
            Some(column) => Some(table.scalar(data, row, column)?),
            None => self.zero,
        };
        Ok(scale.map(|scale| (scale, zero.unwrap_or(0.0))))
    }

    /// Tiles the quantizer could not represent are kept as raw floats.
    fn lossless_tile(
        &self,
        table: &Table,
        columns: &TileColumns,
        data: &[u8],
        row: usize,
        len: usize,
    ) -> io::Result<Vec<f32>> {
        if let Some(column) = columns.gzip {
            let bytes = table.heap(data, row, column)?;
            if !bytes.is_empty() {
                return floats(&gunzip(bytes)?, self.zbitpix, len);
            }
        }
        if let Some(column) = columns.uncompressed {
            let bytes = table.heap(data, row, column)?;
            if !bytes.is_empty() {
                let bitpix = match column.field {
                    Field::Descriptor { element: b'D', .. } => -64,
                    _ => -32,
                };
                return floats(bytes, bitpix, len);
            }
        }
        Err(invalid(format!("tile {row} has no data")))
    }

    fn dequantize(
        &self,
        values: &[i64],
        row: usize,
        scale: f64,
        zero: f64,
        blank: i64,
    ) -> Vec<f32> {
        if self.dither == Dither::None {
            return values
                .iter()
                .map(|&v| {
                    if v == blank {
                        f32::NAN
                    } else {
                        (v as f64 * scale + zero) as f32
                    }
                })
                .collect();
        }

        let mut offsets = DitherSequence::for_tile(row, self.dither_seed);
        values
            .iter()
            .map(|&v| {
                // The sequence advances for every pixel, null or not.
                let offset = offsets.next_offset();
                if v == blank {
                    f32::NAN
                } else if self.dither == Dither::Subtractive2 && v == ZERO_VALUE {
                    0.0
                } else {
                    ((v as f64 - f64::from(offset) + 0.5) * scale + zero) as f32
                }
            })
            .collect()
    }
}

/// Park-Miller sequence shared by quantizing writers and readers.
fn random_table() -> &'static [f32] {
    static TABLE: OnceLock<Vec<f32>> = OnceLock::new();
    TABLE.get_or_init(|| {
        const A: f64 = 16_807.0;
        const M: f64 = 2_147_483_647.0;
        let mut seed = 1.0_f64;
        (0..RANDOM_COUNT)
            .map(|_| {
                let t = A * seed;
                seed = t - M * (t / M).trunc();
                (seed / M) as f32
            })
            .collect()
    })
}

/// Walks the random table from the position assigned to one tile.
struct DitherSequence {
    table: &'static [f32],
    seed: usize,
    next: usize,
}

impl DitherSequence {
    fn for_tile(row: usize, dither_seed: i64) -> Self {
        let table = random_table();
        let seed = (row as i64 + dither_seed - 1).rem_euclid(RANDOM_COUNT as i64) as usize;
        Self {
            table,
            seed,
            next: Self::start(table, seed),
        }
    }

    fn start(table: &[f32], seed: usize) -> usize {
        (table[seed] * 500.0) as usize
    }

    fn next_offset(&mut self) -> f32 {
        let offset = self.table[self.next];
        self.next += 1;
        if self.next == RANDOM_COUNT {
            self.seed = (self.seed + 1) % RANDOM_COUNT;
            self.next = Self::start(self.table, self.seed);
        }
        offset
    }
}

fn gunzip(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Undo `GZIP_2` byte shuffling, which stores all most significant bytes
/// first, then all second bytes, and so on.
fn unshuffle(shuffled: &[u8], width: usize) -> Vec<u8> {
    let n = shuffled.len() / width;
    let mut out = shuffled.to_vec();
    for i in 0..n {
        for j in 0..width {
            out[i * width + j] = shuffled[j * n + i];
        }
    }
    out
}

fn check_len(raw: &[u8], width: usize, len: usize) -> io::Result<()> {
    if raw.len() != width * len {
        return Err(invalid(format!(
            "tile holds {} bytes, expected {len} pixels of {width} bytes",
            raw.len()
        )));
    }
    Ok(())
}

fn integers(raw: &[u8], width: usize, len: usize) -> io::Result<Vec<i64>> {
    check_len(raw, width, len)?;
    Ok(raw
        .chunks_exact(width)
        .map(|b| {
            let v = be_uint(b);
            match width {
                1 => v as i64,
                2 => i64::from(v as u16 as i16),
                4 => i64::from(v as u32 as i32),
                _ => v as i64,
            }
        })
        .collect())
}

fn floats(raw: &[u8], bitpix: i64, len: usize) -> io::Result<Vec<f32>> {
    let width = if bitpix == -64 { 8 } else { 4 };
    check_len(raw, width, len)?;
    Ok(raw
        .chunks_exact(width)
        .map(|b| {
            if width == 8 {
                f64::from_bits(be_uint(b)) as f32
            } else {
                f32::from_bits(be_uint(b) as u32)
            }
        })
        .collect())
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b))
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::loader::rice::tests::encode;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::{Cursor, Write};

    pub(crate) type Card = (String, String);

    pub(crate) fn kv(key: impl Into<String>, value: impl ToString) -> Card {
        (key.into(), value.to_string())
    }

    /// Header unit with fixed-format cards, padded to whole blocks.
    pub(crate) fn header_unit(cards: &[Card]) -> Vec<u8> {
        let mut text = String::new();
        for (key, value) in cards {
            let card = if value.starts_with('\'') {
                format!("{key:<8}= {value:<20}")
            } else {
                format!("{key:<8}= {value:>20}")
            };
            text.push_str(&format!("{card:<80}"));
        }
        text.push_str(&format!("{:<80}", "END"));
        let mut bytes = text.into_bytes();
        bytes.resize(bytes.len().div_ceil(2880) * 2880, b' ');
        bytes
    }

    pub(crate) fn data_unit(mut bytes: Vec<u8>) -> Vec<u8> {
        bytes.resize(bytes.len().div_ceil(2880) * 2880, 0);
        bytes
    }

    pub(crate) fn empty_primary() -> Vec<u8> {
        header_unit(&[
            kv("SIMPLE", "T"),
            kv("BITPIX", 8),
            kv("NAXIS", 0),
            kv("EXTEND", "T"),
        ])
    }

    pub(crate) enum Cell {
        Heap(Vec<u8>),
        Double(f64),
    }

    /// `BINTABLE` HDU whose columns are all 8 bytes wide: `1P?` heap
    /// descriptors or `1D` doubles.
    pub(crate) fn table_hdu(
        columns: &[(&str, &str)],
        rows: &[Vec<Cell>],
        extra: &[Card],
    ) -> Vec<u8> {
        let mut main = Vec::new();
        let mut heap: Vec<u8> = Vec::new();
        for row in rows {
            for cell in row {
                match cell {
                    Cell::Heap(bytes) => {
                        main.extend((bytes.len() as u32).to_be_bytes());
                        main.extend((heap.len() as u32).to_be_bytes());
                        heap.extend(bytes);
                    }
                    Cell::Double(v) => main.extend(v.to_be_bytes()),
                }
            }
        }

        let mut cards = vec![
            kv("XTENSION", "'BINTABLE'"),
            kv("BITPIX", 8),
            kv("NAXIS", 2),
            kv("NAXIS1", 8 * columns.len()),
            kv("NAXIS2", rows.len()),
            kv("PCOUNT", heap.len()),
            kv("GCOUNT", 1),
            kv("TFIELDS", columns.len()),
        ];
        for (i, (name, form)) in columns.iter().enumerate() {
            cards.push(kv(format!("TTYPE{}", i + 1), format!("'{name}'")));
            cards.push(kv(format!("TFORM{}", i + 1), format!("'{form}'")));
        }
        cards.extend_from_slice(extra);

        main.extend(heap);
        let mut bytes = header_unit(&cards);
        bytes.extend(data_unit(main));
        bytes
    }

    const COMPRESSED_ONLY: [(&str, &str); 1] = [("COMPRESSED_DATA", "1PB")];

    pub(crate) const QUANTIZED_COLUMNS: [(&str, &str); 3] =
        [("COMPRESSED_DATA", "1PB"), ("ZSCALE", "1D"), ("ZZERO", "1D")];

    pub(crate) fn image_cards(
        zbitpix: i64,
        width: usize,
        height: usize,
        tile: (usize, usize),
        codec: &str,
    ) -> Vec<Card> {
        vec![
            kv("ZIMAGE", "T"),
            kv("ZCMPTYPE", format!("'{codec}'")),
            kv("ZBITPIX", zbitpix),
            kv("ZNAXIS", 2),
            kv("ZNAXIS1", width),
            kv("ZNAXIS2", height),
            kv("ZTILE1", tile.0),
            kv("ZTILE2", tile.1),
        ]
    }

    /// A 4x3 float image, one Rice tile per row, quantized as
    /// `100 + 0.5 * (4 * y + x)`.
    pub(crate) fn rice_quantized_file() -> Vec<u8> {
        let rows: Vec<Vec<Cell>> = (0..3)
            .map(|y| {
                let ints: Vec<i32> = (0..4).map(|x| 4 * y + x).collect();
                vec![Cell::Heap(encode(&ints, 4, 32)), Cell::Double(0.5), Cell::Double(100.0)]
            })
            .collect();
        let mut cards = image_cards(-32, 4, 3, (4, 1), "RICE_1");
        cards.extend([
            kv("ZNAME1", "'BLOCKSIZE'"),
            kv("ZVAL1", 32),
            kv("ZNAME2", "'BYTEPIX'"),
            kv("ZVAL2", 4),
            kv("ZQUANTIZ", "'NO_DITHER'"),
        ]);
        [empty_primary(), table_hdu(&QUANTIZED_COLUMNS, &rows, &cards)].concat()
    }

    fn decode_file(bytes: Vec<u8>) -> io::Result<Array2<f32>> {
        let mut cursor = Cursor::new(bytes);
        match locate_image(&mut cursor)? {
            Some(ImageHdu::TileCompressed { header, data_start }) => {
                read_tile_compressed(&mut cursor, &header, data_start)
            }
            other => panic!("expected a tile-compressed image, found {other:?}"),
        }
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn rice_tiles_with_quantization() {
        let image = decode_file(rice_quantized_file()).unwrap();
        assert_eq!(image.dim(), (3, 4));
        assert_eq!(image[[0, 0]], 100.0);
        assert_eq!(image[[1, 2]], 103.0);
        assert_eq!(image[[2, 3]], 105.5);
    }

    #[test]
    fn edge_tiles_are_cropped() {
        // 5x3 image in 2x2 tiles: three tiles across, two down.
        let value = |x: usize, y: usize| 10 * y as i32 + x as i32 - 7;
        let rows: Vec<Vec<Cell>> = (0..6)
            .map(|row| {
                let (x0, y0) = (2 * (row % 3), 2 * (row / 3));
                let mut ints = Vec::new();
                for y in y0..(y0 + 2).min(3) {
                    for x in x0..(x0 + 2).min(5) {
                        ints.push(value(x, y));
                    }
                }
                vec![Cell::Heap(encode(&ints, 2, 32))]
            })
            .collect();
        let mut cards = image_cards(16, 5, 3, (2, 2), "RICE_1");
        cards.push(kv("BZERO", 1000));
        let file = [empty_primary(), table_hdu(&COMPRESSED_ONLY, &rows, &cards)].concat();

        let image = decode_file(file).unwrap();
        assert_eq!(image.dim(), (3, 5));
        for ((y, x), &v) in image.indexed_iter() {
            assert_eq!(v, (value(x, y) + 1000) as f32, "pixel ({x}, {y})");
        }
    }

    #[test]
    fn subtractive_dither_follows_the_random_table() {
        let rows: Vec<Vec<Cell>> = (0..2)
            .map(|_| {
                let tile = encode(&[10; 4], 4, 32);
                vec![Cell::Heap(tile), Cell::Double(0.25), Cell::Double(0.0)]
            })
            .collect();
        let mut cards = image_cards(-32, 4, 2, (4, 1), "RICE_1");
        cards.extend([kv("ZQUANTIZ", "'SUBTRACTIVE_DITHER_1'"), kv("ZDITHER0", 3)]);
        let file = [empty_primary(), table_hdu(&QUANTIZED_COLUMNS, &rows, &cards)].concat();
        let image = decode_file(file).unwrap();

        let table = random_table();
        for y in 0..2 {
            let start = (table[y + 2] * 500.0) as usize;
            for x in 0..4 {
                let expected = ((10.0 - f64::from(table[start + x]) + 0.5) * 0.25) as f32;
                assert_eq!(image[[y, x]], expected);
                assert!((image[[y, x]] - 2.5).abs() <= 0.125);
            }
        }
    }

    #[test]
    fn nulls_and_exact_zeros() {
        let ints = [NULL_VALUE as i32, ZERO_VALUE as i32, 4, 4];
        let tile = encode(&ints, 4, 32);
        let rows = vec![vec![Cell::Heap(tile), Cell::Double(1.0), Cell::Double(0.0)]];
        let mut cards = image_cards(-32, 4, 1, (4, 1), "RICE_1");
        cards.push(kv("ZQUANTIZ", "'SUBTRACTIVE_DITHER_2'"));
        let file = [empty_primary(), table_hdu(&QUANTIZED_COLUMNS, &rows, &cards)].concat();

        let image = decode_file(file).unwrap();
        assert!(image[[0, 0]].is_nan());
        assert_eq!(image[[0, 1]], 0.0);
        assert!((image[[0, 2]] - 4.0).abs() <= 0.5);
    }

    #[test]
    fn gzip_tiles_of_integers() {
        let values: [i16; 6] = [-3, 0, 7, 300, i16::MIN, i16::MAX];
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        let mut shuffled = vec![0; raw.len()];
        for i in 0..values.len() {
            for j in 0..2 {
                shuffled[j * values.len() + i] = raw[i * 2 + j];
            }
        }

        for (codec, payload) in [("GZIP_1", raw.clone()), ("GZIP_2", shuffled)] {
            let rows = vec![vec![Cell::Heap(gzip(&payload))]];
            let cards = image_cards(16, 3, 2, (3, 2), codec);
            let file = [empty_primary(), table_hdu(&COMPRESSED_ONLY, &rows, &cards)].concat();
            let image = decode_file(file).unwrap();
            let decoded: Vec<f32> = image.iter().copied().collect();
            let expected: Vec<f32> = values.iter().map(|&v| f32::from(v)).collect();
            assert_eq!(decoded, expected, "{codec}");
        }
    }

    #[test]
    fn unquantizable_tile_falls_back_to_gzipped_floats() {
        let floats: Vec<u8> = [1.25_f32, f32::NAN].iter().flat_map(|v| v.to_be_bytes()).collect();
        let rows = vec![
            vec![
                Cell::Heap(encode(&[1, 2], 4, 32)),
                Cell::Heap(Vec::new()),
                Cell::Double(1.0),
                Cell::Double(0.0),
            ],
            vec![
                Cell::Heap(Vec::new()),
                Cell::Heap(gzip(&floats)),
                Cell::Double(1.0),
                Cell::Double(0.0),
            ],
        ];
        let columns = [
            ("COMPRESSED_DATA", "1PB"),
            ("GZIP_COMPRESSED_DATA", "1PB"),
            ("ZSCALE", "1D"),
            ("ZZERO", "1D"),
        ];
        let cards = image_cards(-32, 2, 2, (2, 1), "RICE_1");
        let file = [empty_primary(), table_hdu(&columns, &rows, &cards)].concat();

        let image = decode_file(file).unwrap();
        assert_eq!(image[[0, 0]], 1.0);
        assert_eq!(image[[0, 1]], 2.0);
        assert_eq!(image[[1, 0]], 1.25);
        assert!(image[[1, 1]].is_nan());
    }

    #[test]
    fn unsupported_codec_is_an_error() {
        let rows = vec![vec![Cell::Heap(vec![1, 2, 3])]];
        let cards = image_cards(16, 2, 1, (2, 1), "HCOMPRESS_1");
        let file = [empty_primary(), table_hdu(&COMPRESSED_ONLY, &rows, &cards)].concat();
        let err = decode_file(file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("HCOMPRESS_1"));
    }

    #[test]
    fn tile_count_must_match_rows() {
        let rows = vec![vec![Cell::Heap(encode(&[1, 2], 2, 32))]];
        let cards = image_cards(16, 2, 2, (2, 1), "RICE_1");
        let file = [empty_primary(), table_hdu(&COMPRESSED_ONLY, &rows, &cards)].concat();
        assert!(decode_file(file).is_err());
    }

    #[test]
    fn truncated_table_is_an_error() {
        let mut file = rice_quantized_file();
        file.truncate(file.len() - 2880);
        let err = decode_file(file).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn locate_distinguishes_plain_and_missing_images() {
        let plain = header_unit(&[
            kv("SIMPLE", "T"),
            kv("BITPIX", 8),
            kv("NAXIS", 2),
            kv("NAXIS1", 2),
            kv("NAXIS2", 2),
        ]);
        let plain = [plain, data_unit(vec![0; 4])].concat();
        assert!(matches!(
            locate_image(&mut Cursor::new(plain)).unwrap(),
            Some(ImageHdu::Plain)
        ));
        assert!(locate_image(&mut Cursor::new(empty_primary())).unwrap().is_none());
        assert!(locate_image(&mut Cursor::new(Vec::new())).unwrap().is_none());
    }

    #[test]
    fn card_values() {
        assert_eq!(parse_value(" 'IMAGE   '  / ext"), Some(Value::Text("IMAGE".into())));
        assert_eq!(parse_value("'O''Brien'"), Some(Value::Text("O'Brien".into())));
        assert_eq!(parse_value("                   T"), Some(Value::Logical(true)));
        assert_eq!(parse_value("  -32 / bits"), Some(Value::Integer(-32)));
        assert_eq!(parse_value("  1.5D2"), Some(Value::Float(150.0)));
        assert_eq!(parse_value("   / only a comment"), None);
        assert_eq!(parse_value("'unterminated"), None);
    }

    #[test]
    fn tform_widths() {
        assert!(matches!(
            parse_tform("1PB(2048)").unwrap(),
            (8, Field::Descriptor { wide: false, element: b'B' })
        ));
        assert!(matches!(
            parse_tform("1QE").unwrap(),
            (16, Field::Descriptor { wide: true, element: b'E' })
        ));
        assert!(matches!(parse_tform("D").unwrap(), (8, Field::Scalar(b'D'))));
        assert!(matches!(parse_tform("3J").unwrap(), (12, Field::Scalar(b'J'))));
        assert!(matches!(parse_tform("12X").unwrap(), (2, Field::Scalar(b'X'))));
        assert!(parse_tform("1PZ").is_err());
    }

    #[test]
    fn random_table_matches_the_reference_sequence() {
        let table = random_table();
        assert_eq!(table.len(), RANDOM_COUNT);
        assert!((table[0] - 16_807.0 / 2_147_483_647.0).abs() < 1e-12);
        // The generator's state after 10000 draws is 1043618065.
        let last = f64::from(table[RANDOM_COUNT - 1]);
        assert!((last - 1_043_618_065.0 / 2_147_483_647.0).abs() < 1e-7);
    }
}

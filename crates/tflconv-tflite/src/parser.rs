//! TFLite FlatBuffer parser
//!
//! Reads `.tflite` files back into plain structs so converted models can
//! be inspected and verified. Every offset is bounds-checked; malformed
//! input produces [`ParseError::Malformed`] rather than a panic.

use crate::schema::{BuiltinOptions, TFLiteDataType, TFLITE_FILE_IDENTIFIER};
use byteorder::{ByteOrder, LittleEndian};
use tflconv_core::ParseError;

/// Parsed TFLite model
#[derive(Debug, Clone)]
pub struct TFLiteModel {
    /// TFLite schema version
    pub version: u32,
    /// Model description
    pub description: Option<String>,
    /// Builtin code of each operator code entry
    pub operator_codes: Vec<i32>,
    pub subgraphs: Vec<TFLiteSubgraph>,
    /// Raw buffer contents; index 0 is conventionally empty
    pub buffers: Vec<Vec<u8>>,
    pub metadata: Vec<TFLiteMetadata>,
}

impl TFLiteModel {
    /// Look up a metadata entry's buffer by name
    pub fn metadata_buffer(&self, name: &str) -> Option<&[u8]> {
        let entry = self.metadata.iter().find(|m| m.name == name)?;
        self.buffers.get(entry.buffer as usize).map(Vec::as_slice)
    }

    /// Total number of tensors across all subgraphs
    pub fn tensor_count(&self) -> usize {
        self.subgraphs.iter().map(|s| s.tensors.len()).sum()
    }
}

/// A subgraph of a TFLite model
#[derive(Debug, Clone, Default)]
pub struct TFLiteSubgraph {
    pub name: Option<String>,
    pub tensors: Vec<TFLiteTensor>,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub operators: Vec<TFLiteOperator>,
}

/// A tensor in a TFLite model
#[derive(Debug, Clone)]
pub struct TFLiteTensor {
    /// Tensor name
    pub name: String,
    /// Shape dimensions
    pub shape: Vec<i32>,
    /// Data type
    pub dtype: TFLiteDataType,
    /// Buffer index in the model
    pub buffer_index: u32,
    /// Constant data; empty for activations
    pub data: Vec<u8>,
}

/// An operator in a subgraph
#[derive(Debug, Clone, PartialEq)]
pub struct TFLiteOperator {
    pub opcode_index: u32,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    /// `BuiltinOptions` union tag
    pub options_type: u8,
    /// Decoded options; `None` for option-less or unknown operators
    pub options: Option<TFLiteOptions>,
}

/// Builtin options of the operator kinds tflconv writes
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TFLiteOptions {
    Conv2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        activation: i8,
        dilation_w: i32,
        dilation_h: i32,
    },
    DepthwiseConv2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        depth_multiplier: i32,
        activation: i8,
        dilation_w: i32,
        dilation_h: i32,
    },
    Pool2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        filter_w: i32,
        filter_h: i32,
    },
    FullyConnected {
        activation: i8,
        keep_num_dims: bool,
    },
    LeakyRelu {
        alpha: f32,
    },
}

/// A named metadata entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TFLiteMetadata {
    pub name: String,
    pub buffer: u32,
}

/// Check whether data carries the TFLite file identifier
pub fn is_tflite(data: &[u8]) -> bool {
    data.get(4..8) == Some(TFLITE_FILE_IDENTIFIER.as_bytes())
}

/// TFLite model parser
#[derive(Debug, Clone, Copy, Default)]
pub struct TFLiteParser;

impl TFLiteParser {
    /// Create a new parser
    pub fn new() -> Self {
        Self
    }

    /// Parse a TFLite model from bytes
    pub fn parse(&self, data: &[u8]) -> Result<TFLiteModel, ParseError> {
        if data.len() < 8 {
            return Err(ParseError::Malformed("File too small".into()));
        }
        if !is_tflite(data) {
            return Err(ParseError::InvalidMagic);
        }

        // Offset 0 holds the root table offset, offset 4 the identifier
        let root = read_u32(data, 0)? as usize;
        let model = Table::at(data, root)?;

        let version = model.u32_field(0, 0)?;
        let description = model.string_field(3)?;

        let operator_codes = model
            .tables_field(1)?
            .into_iter()
            .map(|code| {
                let builtin = code.i32_field(3, 0)?;
                let deprecated = code.i8_field(0, 0)? as i32;
                Ok(builtin.max(deprecated))
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        let buffers = model
            .tables_field(4)?
            .into_iter()
            .map(|buffer| buffer.bytes_field(0))
            .collect::<Result<Vec<_>, _>>()?;

        let subgraphs = model
            .tables_field(2)?
            .into_iter()
            .map(|subgraph| self.parse_subgraph(&subgraph, &buffers))
            .collect::<Result<Vec<_>, _>>()?;

        let metadata = model
            .tables_field(6)?
            .into_iter()
            .map(|entry| {
                Ok(TFLiteMetadata {
                    name: entry.string_field(0)?.unwrap_or_default(),
                    buffer: entry.u32_field(1, 0)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(TFLiteModel {
            version,
            description,
            operator_codes,
            subgraphs,
            buffers,
            metadata,
        })
    }

    fn parse_subgraph(
        &self,
        table: &Table<'_>,
        buffers: &[Vec<u8>],
    ) -> Result<TFLiteSubgraph, ParseError> {
        let tensors = table
            .tables_field(0)?
            .into_iter()
            .enumerate()
            .map(|(idx, tensor)| self.parse_tensor(&tensor, buffers, idx))
            .collect::<Result<Vec<_>, _>>()?;

        let operators = table
            .tables_field(3)?
            .into_iter()
            .map(|op| {
                Ok(TFLiteOperator {
                    opcode_index: op.u32_field(0, 0)?,
                    inputs: op.i32_vector_field(1)?,
                    outputs: op.i32_vector_field(2)?,
                    options_type: op.u8_field(3, 0)?,
                    options: parse_options(&op)?,
                })
            })
            .collect::<Result<Vec<_>, ParseError>>()?;

        Ok(TFLiteSubgraph {
            name: table.string_field(4)?,
            tensors,
            inputs: table.i32_vector_field(1)?,
            outputs: table.i32_vector_field(2)?,
            operators,
        })
    }

    fn parse_tensor(
        &self,
        table: &Table<'_>,
        buffers: &[Vec<u8>],
        tensor_idx: usize,
    ) -> Result<TFLiteTensor, ParseError> {
        let type_val = table.u8_field(1, 0)?;
        let dtype = TFLiteDataType::from_u8(type_val).ok_or_else(|| {
            ParseError::Malformed(format!("Unknown tensor type {}", type_val))
        })?;

        let buffer_index = table.u32_field(2, 0)?;
        let data = buffers
            .get(buffer_index as usize)
            .cloned()
            .ok_or_else(|| {
                ParseError::Malformed(format!("Buffer index {} out of range", buffer_index))
            })?;

        Ok(TFLiteTensor {
            name: table
                .string_field(3)?
                .unwrap_or_else(|| format!("tensor_{}", tensor_idx)),
            shape: table.i32_vector_field(0)?,
            dtype,
            buffer_index,
            data,
        })
    }
}

/// A FlatBuffer table positioned inside the model bytes
struct Table<'a> {
    data: &'a [u8],
    pos: usize,
    vtable: &'a [u8],
}

impl<'a> Table<'a> {
    fn at(data: &'a [u8], pos: usize) -> Result<Self, ParseError> {
        // The table starts with a signed offset back to its vtable
        let soffset = read_i32(data, pos)? as i64;
        let vtable_pos = usize::try_from(pos as i64 - soffset)
            .map_err(|_| ParseError::Malformed("Invalid vtable offset".into()))?;

        let vtable_size = read_u16(data, vtable_pos)? as usize;
        if vtable_size < 4 || vtable_size % 2 != 0 {
            return Err(ParseError::Malformed("Invalid vtable size".into()));
        }
        let vtable = slice(data, vtable_pos, vtable_size)?;

        Ok(Self { data, pos, vtable })
    }

    /// Absolute position of a field, or `None` when it is absent
    fn field_pos(&self, index: usize) -> Option<usize> {
        let slot = 4 + index * 2;
        let offset = self.vtable.get(slot..slot + 2).map(LittleEndian::read_u16)?;
        (offset != 0).then(|| self.pos + offset as usize)
    }

    fn u8_field(&self, index: usize, default: u8) -> Result<u8, ParseError> {
        match self.field_pos(index) {
            Some(pos) => Ok(slice(self.data, pos, 1)?[0]),
            None => Ok(default),
        }
    }

    fn i8_field(&self, index: usize, default: i8) -> Result<i8, ParseError> {
        Ok(self.u8_field(index, default as u8)? as i8)
    }

    fn u32_field(&self, index: usize, default: u32) -> Result<u32, ParseError> {
        match self.field_pos(index) {
            Some(pos) => read_u32(self.data, pos),
            None => Ok(default),
        }
    }

    fn i32_field(&self, index: usize, default: i32) -> Result<i32, ParseError> {
        match self.field_pos(index) {
            Some(pos) => read_i32(self.data, pos),
            None => Ok(default),
        }
    }

    /// Follow an offset field to the referenced object
    fn indirect(&self, index: usize) -> Result<Option<usize>, ParseError> {
        match self.field_pos(index) {
            Some(pos) => follow(self.data, pos).map(Some),
            None => Ok(None),
        }
    }

    fn string_field(&self, index: usize) -> Result<Option<String>, ParseError> {
        match self.indirect(index)? {
            Some(pos) => {
                let bytes = self.vector_bytes(pos, 1)?;
                String::from_utf8(bytes.to_vec())
                    .map(Some)
                    .map_err(|e| ParseError::Malformed(format!("Invalid UTF-8: {}", e)))
            }
            None => Ok(None),
        }
    }

    fn bytes_field(&self, index: usize) -> Result<Vec<u8>, ParseError> {
        match self.indirect(index)? {
            Some(pos) => Ok(self.vector_bytes(pos, 1)?.to_vec()),
            None => Ok(Vec::new()),
        }
    }

    fn i32_vector_field(&self, index: usize) -> Result<Vec<i32>, ParseError> {
        match self.indirect(index)? {
            Some(pos) => {
                let bytes = self.vector_bytes(pos, 4)?;
                Ok(bytes.chunks_exact(4).map(LittleEndian::read_i32).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    fn tables_field(&self, index: usize) -> Result<Vec<Table<'a>>, ParseError> {
        let Some(pos) = self.indirect(index)? else {
            return Ok(Vec::new());
        };

        let count = self.vector_bytes(pos, 4)?.len() / 4;
        (0..count)
            .map(|i| {
                let elem_pos = pos + 4 + i * 4;
                Table::at(self.data, follow(self.data, elem_pos)?)
            })
            .collect()
    }

    /// Element bytes of a length-prefixed vector
    fn vector_bytes(&self, pos: usize, elem_size: usize) -> Result<&'a [u8], ParseError> {
        let count = read_u32(self.data, pos)? as usize;
        let len = count
            .checked_mul(elem_size)
            .ok_or_else(|| ParseError::Malformed("Vector length overflow".into()))?;
        slice(self.data, pos + 4, len)
    }
}

/// Resolve a forward uoffset stored at `pos`
fn follow(data: &[u8], pos: usize) -> Result<usize, ParseError> {
    let offset = read_u32(data, pos)? as usize;
    pos.checked_add(offset)
        .filter(|&target| target < data.len())
        .ok_or_else(|| ParseError::Malformed("Offset out of bounds".into()))
}

fn slice(data: &[u8], pos: usize, len: usize) -> Result<&[u8], ParseError> {
    pos.checked_add(len)
        .and_then(|end| data.get(pos..end))
        .ok_or_else(|| ParseError::Malformed("Read out of bounds".into()))
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, ParseError> {
    slice(data, pos, 2).map(LittleEndian::read_u16)
}

fn parse_options(op: &Table) -> Result<Option<TFLiteOptions>, ParseError> {
    let options_type = op.u8_field(3, 0)?;
    let Some(pos) = op.indirect(4)? else {
        return Ok(None);
    };
    let t = Table::at(op.data, pos)?;

    let options = match options_type {
        x if x == BuiltinOptions::Conv2DOptions as u8 => TFLiteOptions::Conv2D {
            padding: t.i8_field(0, 0)?,
            stride_w: t.i32_field(1, 0)?,
            stride_h: t.i32_field(2, 0)?,
            activation: t.i8_field(3, 0)?,
            dilation_w: t.i32_field(4, 1)?,
            dilation_h: t.i32_field(5, 1)?,
        },
        x if x == BuiltinOptions::DepthwiseConv2DOptions as u8 => TFLiteOptions::DepthwiseConv2D {
            padding: t.i8_field(0, 0)?,
            stride_w: t.i32_field(1, 0)?,
            stride_h: t.i32_field(2, 0)?,
            depth_multiplier: t.i32_field(3, 0)?,
            activation: t.i8_field(4, 0)?,
            dilation_w: t.i32_field(5, 1)?,
            dilation_h: t.i32_field(6, 1)?,
        },
        x if x == BuiltinOptions::Pool2DOptions as u8 => TFLiteOptions::Pool2D {
            padding: t.i8_field(0, 0)?,
            stride_w: t.i32_field(1, 0)?,
            stride_h: t.i32_field(2, 0)?,
            filter_w: t.i32_field(3, 0)?,
            filter_h: t.i32_field(4, 0)?,
        },
        x if x == BuiltinOptions::FullyConnectedOptions as u8 => TFLiteOptions::FullyConnected {
            activation: t.i8_field(0, 0)?,
            keep_num_dims: t.u8_field(2, 0)? != 0,
        },
        x if x == BuiltinOptions::LeakyReluOptions as u8 => TFLiteOptions::LeakyRelu {
            alpha: f32::from_bits(t.u32_field(0, 0)?),
        },
        _ => return Ok(None),
    };

    Ok(Some(options))
}

fn read_i32(data: &[u8], pos: usize) -> Result<i32, ParseError> {
    slice(data, pos, 4).map(LittleEndian::read_i32)
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, ParseError> {
    slice(data, pos, 4).map(LittleEndian::read_u32)
}

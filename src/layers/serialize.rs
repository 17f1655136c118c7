//! Binary layer persistence
//!
//! A layer serializes as, in order: input shape, output shape, activation
//! kind, weight count and values, bias count and values, then layer-kind
//! specific structural fields. All integers are little-endian `u32`, floats
//! are little-endian IEEE 754 singles.
//!
//! Deserialization is all-or-nothing: any field that cannot be read yields
//! `None` rather than an error, so a caller can distinguish a truncated or
//! corrupt stream from a hard failure contextually and never observes a
//! partially constructed layer.

use std::io::{Read, Write};
use std::sync::Arc;

use crate::activations::ActivationKind;
use crate::backend::Backend;
use crate::layers::{ConvolutionalLayer, DenseLayer, Layer, LayerKind, PoolingLayer};
use crate::tensor::TensorShape;

pub(crate) fn write_u32(writer: &mut dyn Write, value: u32) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub(crate) fn write_u8(writer: &mut dyn Write, value: u8) -> std::io::Result<()> {
    writer.write_all(&[value])
}

pub(crate) fn write_f32(writer: &mut dyn Write, value: f32) -> std::io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

pub(crate) fn write_shape(writer: &mut dyn Write, shape: TensorShape) -> std::io::Result<()> {
    write_u32(writer, shape.channels as u32)?;
    write_u32(writer, shape.height as u32)?;
    write_u32(writer, shape.width as u32)
}

/// Writes a counted f32 slice: `u32` length followed by the values.
pub(crate) fn write_values(writer: &mut dyn Write, values: &[f32]) -> std::io::Result<()> {
    write_u32(writer, values.len() as u32)?;
    for &value in values {
        write_f32(writer, value)?;
    }
    Ok(())
}

/// Writes the header every layer kind shares.
pub(crate) fn write_header(writer: &mut dyn Write, layer: &dyn Layer) -> std::io::Result<()> {
    write_shape(writer, layer.input_shape())?;
    write_shape(writer, layer.output_shape())?;
    write_u8(writer, layer.activation().tag())?;
    write_values(writer, layer.weights())?;
    write_values(writer, layer.biases())
}

pub(crate) fn read_u8(reader: &mut dyn Read) -> Option<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf).ok()?;
    Some(buf[0])
}

pub(crate) fn read_u32(reader: &mut dyn Read) -> Option<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).ok()?;
    Some(u32::from_le_bytes(buf))
}

pub(crate) fn read_f32(reader: &mut dyn Read) -> Option<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).ok()?;
    Some(f32::from_le_bytes(buf))
}

pub(crate) fn read_shape(reader: &mut dyn Read) -> Option<TensorShape> {
    let channels = read_u32(reader)? as usize;
    let height = read_u32(reader)? as usize;
    let width = read_u32(reader)? as usize;
    Some(TensorShape::new(channels, height, width))
}

/// Reads a counted f32 slice written by [`write_values`].
pub(crate) fn read_values(reader: &mut dyn Read) -> Option<Vec<f32>> {
    let count = read_u32(reader)? as usize;
    let mut values = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
        values.push(read_f32(reader)?);
    }
    Some(values)
}

/// The fields shared by every serialized layer kind.
pub(crate) struct LayerHeader {
    pub input: TensorShape,
    pub output: TensorShape,
    pub activation: ActivationKind,
    pub weights: Vec<f32>,
    pub biases: Vec<f32>,
}

pub(crate) fn read_header(reader: &mut dyn Read) -> Option<LayerHeader> {
    let input = read_shape(reader)?;
    let output = read_shape(reader)?;
    let activation = ActivationKind::from_tag(read_u8(reader)?)?;
    let weights = read_values(reader)?;
    let biases = read_values(reader)?;
    Some(LayerHeader {
        input,
        output,
        activation,
        weights,
        biases,
    })
}

/// Writes one framed layer record: a kind tag followed by the layer body.
pub fn write_layer(writer: &mut dyn Write, layer: &dyn Layer) -> std::io::Result<()> {
    write_u8(writer, layer.kind().tag())?;
    layer.serialize(writer)
}

/// Reads one framed layer record written by [`write_layer`].
///
/// Returns `None` when the stream ends before a full record is read or when
/// any field is inconsistent; the stream position is unspecified afterwards,
/// so callers should treat `None` as end-of-data or corruption and stop.
pub fn read_layer(reader: &mut dyn Read, backend: &Arc<dyn Backend>) -> Option<Box<dyn Layer>> {
    let kind = LayerKind::from_tag(read_u8(reader)?)?;
    match kind {
        LayerKind::FullyConnected => {
            DenseLayer::deserialize(reader, Arc::clone(backend)).map(|l| Box::new(l) as Box<dyn Layer>)
        }
        LayerKind::Convolutional => ConvolutionalLayer::deserialize(reader, Arc::clone(backend))
            .map(|l| Box::new(l) as Box<dyn Layer>),
        LayerKind::Pooling => {
            PoolingLayer::deserialize(reader, Arc::clone(backend)).map(|l| Box::new(l) as Box<dyn Layer>)
        }
    }
}

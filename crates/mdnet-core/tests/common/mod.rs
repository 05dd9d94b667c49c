//! Little-endian level-5 MAT-file writer for test fixtures

#![allow(dead_code)]

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

const MI_INT8: u32 = 1;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

const MX_CELL: u8 = 1;
const MX_STRUCT: u8 = 2;
const MX_CHAR: u8 = 4;
const MX_SINGLE: u8 = 7;

pub fn element(data_type: u32, data: &[u8]) -> Vec<u8> {
    let mut bytes = data_type.to_le_bytes().to_vec();
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend_from_slice(data);
    bytes.resize(bytes.len().next_multiple_of(8), 0);
    bytes
}

pub fn matrix(name: &str, class: u8, dims: &[usize], payload: &[u8]) -> Vec<u8> {
    let mut flags = (class as u32).to_le_bytes().to_vec();
    flags.extend_from_slice(&0u32.to_le_bytes());
    let dims: Vec<u8> = dims.iter().flat_map(|&d| (d as i32).to_le_bytes()).collect();

    let mut body = element(MI_UINT32, &flags);
    body.extend(element(MI_INT32, &dims));
    body.extend(element(MI_INT8, name.as_bytes()));
    body.extend_from_slice(payload);
    element(MI_MATRIX, &body)
}

/// `column_major` lists values with the first dimension varying fastest
pub fn single(name: &str, dims: &[usize], column_major: &[f32]) -> Vec<u8> {
    let data: Vec<u8> = column_major.iter().flat_map(|v| v.to_le_bytes()).collect();
    matrix(name, MX_SINGLE, dims, &element(MI_SINGLE, &data))
}

pub fn text(name: &str, value: &str) -> Vec<u8> {
    let data: Vec<u8> = value.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    matrix(name, MX_CHAR, &[1, value.len()], &element(MI_UINT16, &data))
}

pub fn cell(name: &str, items: &[Vec<u8>]) -> Vec<u8> {
    matrix(name, MX_CELL, &[1, items.len()], &items.concat())
}

/// 1x1 struct; `values` are encoded matrices in field order
pub fn structure(name: &str, fields: &[&str], values: &[Vec<u8>]) -> Vec<u8> {
    let name_len = fields.iter().map(|f| f.len() + 1).max().unwrap_or(1);
    let mut names = Vec::with_capacity(name_len * fields.len());
    for field in fields {
        let mut padded = field.as_bytes().to_vec();
        padded.resize(name_len, 0);
        names.extend(padded);
    }

    let mut payload = element(MI_INT32, &(name_len as i32).to_le_bytes());
    payload.extend(element(MI_INT8, &names));
    payload.extend(values.concat());
    matrix(name, MX_STRUCT, &[1, 1], &payload)
}

pub fn compressed(variable: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(variable).unwrap();
    let data = encoder.finish().unwrap();

    let mut bytes = MI_COMPRESSED.to_le_bytes().to_vec();
    bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
    bytes.extend(data);
    bytes
}

pub fn mat_file(variables: &[Vec<u8>]) -> Vec<u8> {
    let mut bytes = b"MATLAB 5.0 MAT-file, Platform: test fixture".to_vec();
    bytes.resize(124, b' ');
    bytes.extend_from_slice(&0x0100u16.to_le_bytes());
    bytes.extend_from_slice(b"IM");
    for variable in variables {
        bytes.extend_from_slice(variable);
    }
    bytes
}

/// Value stored at filter position `(h, w, i, o)`; unique per position
pub fn filter_value(h: usize, w: usize, i: usize, o: usize, dims: [usize; 4]) -> f32 {
    (((h * dims[1] + w) * dims[2] + i) * dims[3] + o) as f32
}

/// MatConvNet conv layer struct with a `(kh, kw, in, out)` filter and `(out, 1)` bias
pub fn conv_layer(name: &str, dims: [usize; 4]) -> Vec<u8> {
    let [kh, kw, cin, cout] = dims;
    let mut filter = Vec::with_capacity(kh * kw * cin * cout);
    for o in 0..cout {
        for i in 0..cin {
            for w in 0..kw {
                for h in 0..kh {
                    filter.push(filter_value(h, w, i, o, dims));
                }
            }
        }
    }
    let bias: Vec<f32> = (0..cout).map(|o| o as f32 * 0.5).collect();

    let weights = cell(
        "",
        &[
            single("", &[kh, kw, cin, cout], &filter),
            single("", &[cout, 1], &bias),
        ],
    );
    structure(
        "",
        &["name", "type", "weights"],
        &[text("", name), text("", "conv"), weights],
    )
}

pub fn plain_layer(name: &str, kind: &str) -> Vec<u8> {
    structure("", &["name", "type"], &[text("", name), text("", kind)])
}

/// A VGG-M-shaped `layers` cell with `count` entries
pub fn vgg_m_layers(count: usize) -> Vec<u8> {
    let kinds = ["relu", "lrn", "pool"];
    let layers: Vec<Vec<u8>> = (0..count)
        .map(|index| match index {
            0 => conv_layer("conv1", [7, 7, 3, 96]),
            4 => conv_layer("conv2", [5, 5, 96, 256]),
            8 => conv_layer("conv3", [3, 3, 256, 512]),
            other => plain_layer(&format!("layer{other}"), kinds[other % 3]),
        })
        .collect();
    cell("layers", &layers)
}

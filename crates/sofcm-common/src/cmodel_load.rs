// cmodel_load.rs -- IBSP v38 lump decoding into collision tables

use crate::cmodel::{CBrush, CBrushSide, CLeaf, CModelContext, CNode, MapData, NodeChild};
use crate::cvar::CollisionConfig;
use crate::q_shared::{CModel, CPlane, CSurface};
use crate::qfiles::{
    lump_name, DHeader, Lump, BSPVERSION, DBRUSHSIDE_SIZE, DBRUSH_SIZE, DLEAFBRUSH_SIZE,
    DLEAF_SIZE, DMODEL_SIZE, DNODE_SIZE, DPLANE_SIZE, HEADER_LUMPS, HEADER_SIZE, IDBSPHEADER,
    LUMP_BRUSHES, LUMP_BRUSHSIDES, LUMP_ENTITIES, LUMP_LEAFBRUSHES, LUMP_LEAFS, LUMP_MODELS,
    LUMP_NODES, LUMP_PLANES, LUMP_TEXINFO, MAX_MAP_BRUSHES, MAX_MAP_BRUSHSIDES,
    MAX_MAP_ENTSTRING, MAX_MAP_LEAFBRUSHES, MAX_MAP_LEAFS, MAX_MAP_MODELS, MAX_MAP_NODES,
    MAX_MAP_PLANES, MAX_MAP_TEXINFO, TEXINFO_SIZE,
};
use md4::{Digest, Md4};
use rayon::prelude::*;
use thiserror::Error;

/// Lumps with at least this many elements are decoded on the rayon pool.
pub const PARALLEL_LUMP_THRESHOLD: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("{name}: file too short for a BSP header ({len} bytes)")]
    TruncatedHeader { name: String, len: usize },
    #[error("{name}: bad ident {ident:#010x}, not an IBSP file")]
    BadMagic { name: String, ident: i32 },
    #[error("{name}: wrong version number ({found} should be {expected})")]
    BadVersion { name: String, found: i32, expected: i32 },
    #[error("{name}: {lump} lump ({fileofs}+{filelen}) lies outside the file")]
    LumpOutOfBounds {
        name: String,
        lump: &'static str,
        fileofs: i32,
        filelen: i32,
    },
    #[error("{name}: funny lump size in {lump} ({len} is not a multiple of {stride})")]
    FunnyLumpSize {
        name: String,
        lump: &'static str,
        len: usize,
        stride: usize,
    },
    #[error("{name}: map has too many {lump} ({count} > {max})")]
    TooMany {
        name: String,
        lump: &'static str,
        count: usize,
        max: usize,
    },
    #[error("{name}: map with no {lump}")]
    Empty { name: String, lump: &'static str },
    #[error("{name}: model {index} has negative headnode {headnode}")]
    BadHeadnode { name: String, index: usize, headnode: i32 },
    #[error("{name}: brushside {index} references texinfo {texinfo} of {numtexinfo}")]
    BadTexinfo {
        name: String,
        index: usize,
        texinfo: i16,
        numtexinfo: usize,
    },
}

// ============================================================
// BSP byte helpers
// ============================================================

fn read_i32_le(data: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_i16_le(data: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn read_f32_le(data: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn read_vec3(data: &[u8], offset: usize) -> [f32; 3] {
    [
        read_f32_le(data, offset),
        read_f32_le(data, offset + 4),
        read_f32_le(data, offset + 8),
    ]
}

/// Block checksum of the whole file: the four MD4 digest words XORed together.
/// Clients compare it against their own copy of the map.
pub fn map_checksum(data: &[u8]) -> u32 {
    let digest = Md4::digest(data);
    digest
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0u32, |acc, w| acc ^ w)
}

// ============================================================
// Header and lump slicing
// ============================================================

pub fn read_header(name: &str, data: &[u8]) -> Result<DHeader, LoadError> {
    if data.len() < HEADER_SIZE {
        return Err(LoadError::TruncatedHeader {
            name: name.to_string(),
            len: data.len(),
        });
    }

    let ident = read_i32_le(data, 0);
    if ident != IDBSPHEADER {
        return Err(LoadError::BadMagic {
            name: name.to_string(),
            ident,
        });
    }
    let version = read_i32_le(data, 4);
    if version != BSPVERSION {
        return Err(LoadError::BadVersion {
            name: name.to_string(),
            found: version,
            expected: BSPVERSION,
        });
    }

    let mut lumps = [Lump::default(); HEADER_LUMPS];
    for (i, lump) in lumps.iter_mut().enumerate() {
        let base = 8 + i * 8;
        lump.fileofs = read_i32_le(data, base);
        lump.filelen = read_i32_le(data, base + 4);
    }
    Ok(DHeader {
        ident,
        version,
        lumps,
    })
}

struct LumpReader<'a> {
    name: &'a str,
    data: &'a [u8],
    header: &'a DHeader,
}

impl<'a> LumpReader<'a> {
    fn bytes(&self, lump: usize) -> Result<&'a [u8], LoadError> {
        let l = self.header.lumps[lump];
        let out_of_bounds = || LoadError::LumpOutOfBounds {
            name: self.name.to_string(),
            lump: lump_name(lump),
            fileofs: l.fileofs,
            filelen: l.filelen,
        };
        let ofs = usize::try_from(l.fileofs).map_err(|_| out_of_bounds())?;
        let len = usize::try_from(l.filelen).map_err(|_| out_of_bounds())?;
        let end = ofs.checked_add(len).ok_or_else(out_of_bounds)?;
        self.data.get(ofs..end).ok_or_else(out_of_bounds)
    }

    /// Splits a lump into fixed-size records and decodes each one, in
    /// parallel once there are enough of them.
    fn records<T, F>(&self, lump: usize, stride: usize, max: usize, parse: F) -> Result<Vec<T>, LoadError>
    where
        T: Send,
        F: Fn(&[u8]) -> T + Sync + Send,
    {
        let bytes = self.bytes(lump)?;
        if bytes.len() % stride != 0 {
            return Err(LoadError::FunnyLumpSize {
                name: self.name.to_string(),
                lump: lump_name(lump),
                len: bytes.len(),
                stride,
            });
        }
        let count = bytes.len() / stride;
        if count > max {
            return Err(LoadError::TooMany {
                name: self.name.to_string(),
                lump: lump_name(lump),
                count,
                max,
            });
        }

        if count >= PARALLEL_LUMP_THRESHOLD {
            Ok(bytes.par_chunks_exact(stride).map(parse).collect())
        } else {
            Ok(bytes.chunks_exact(stride).map(parse).collect())
        }
    }

    fn require(&self, lump: usize, count: usize) -> Result<(), LoadError> {
        if count == 0 {
            return Err(LoadError::Empty {
                name: self.name.to_string(),
                lump: lump_name(lump),
            });
        }
        Ok(())
    }
}

// ============================================================
// Lump loaders
// ============================================================

fn load_surfaces(r: &LumpReader) -> Result<Vec<CSurface>, LoadError> {
    // texinfo_t: vecs[2][4] (32), flags, value, texture[32], nexttexinfo
    r.records(LUMP_TEXINFO, TEXINFO_SIZE, MAX_MAP_TEXINFO, |rec| {
        let tex = &rec[40..72];
        let name_len = tex.iter().position(|&b| b == 0).unwrap_or(tex.len());
        CSurface {
            name: String::from_utf8_lossy(&tex[..name_len]).into_owned(),
            flags: read_i32_le(rec, 32),
            value: read_i32_le(rec, 36),
        }
    })
}

fn load_planes(r: &LumpReader) -> Result<Vec<CPlane>, LoadError> {
    let planes = r.records(LUMP_PLANES, DPLANE_SIZE, MAX_MAP_PLANES, |rec| {
        // the stored type is ignored: only positive axial normals may take the axial shortcut
        CPlane::new(read_vec3(rec, 0), read_f32_le(rec, 12))
    })?;
    r.require(LUMP_PLANES, planes.len())?;
    Ok(planes)
}

fn load_nodes(r: &LumpReader) -> Result<Vec<CNode>, LoadError> {
    let nodes = r.records(LUMP_NODES, DNODE_SIZE, MAX_MAP_NODES, |rec| CNode {
        plane_idx: usize::try_from(read_i32_le(rec, 0)).unwrap_or(usize::MAX),
        children: [
            NodeChild::from_raw(read_i32_le(rec, 4)),
            NodeChild::from_raw(read_i32_le(rec, 8)),
        ],
    })?;
    r.require(LUMP_NODES, nodes.len())?;
    Ok(nodes)
}

fn load_leafs(r: &LumpReader) -> Result<Vec<CLeaf>, LoadError> {
    // dleaf_t: contents at 0, leaf brushes at 24; the visibility fields between are skipped
    let leafs = r.records(LUMP_LEAFS, DLEAF_SIZE, MAX_MAP_LEAFS, |rec| CLeaf {
        contents: read_i32_le(rec, 0),
        firstleafbrush: read_u16_le(rec, 24) as usize,
        numleafbrushes: read_u16_le(rec, 26) as usize,
    })?;
    r.require(LUMP_LEAFS, leafs.len())?;
    Ok(leafs)
}

fn load_leaf_brushes(r: &LumpReader) -> Result<Vec<usize>, LoadError> {
    r.records(LUMP_LEAFBRUSHES, DLEAFBRUSH_SIZE, MAX_MAP_LEAFBRUSHES, |rec| {
        read_u16_le(rec, 0) as usize
    })
}

fn load_brushes(r: &LumpReader) -> Result<Vec<CBrush>, LoadError> {
    r.records(LUMP_BRUSHES, DBRUSH_SIZE, MAX_MAP_BRUSHES, |rec| {
        let firstside = read_i32_le(rec, 0);
        let numsides = read_i32_le(rec, 4);
        let contents = read_i32_le(rec, 8);
        match (usize::try_from(firstside), usize::try_from(numsides)) {
            (Ok(firstbrushside), Ok(numsides)) => CBrush {
                contents,
                firstbrushside,
                numsides,
            },
            // negative ranges leave the brush inert
            _ => CBrush {
                contents,
                firstbrushside: 0,
                numsides: 0,
            },
        }
    })
}

fn load_brush_sides(r: &LumpReader, numtexinfo: usize) -> Result<Vec<CBrushSide>, LoadError> {
    let raw = r.records(LUMP_BRUSHSIDES, DBRUSHSIDE_SIZE, MAX_MAP_BRUSHSIDES, |rec| {
        (read_u16_le(rec, 0) as usize, read_i16_le(rec, 2))
    })?;

    raw.into_iter()
        .enumerate()
        .map(|(index, (plane_idx, texinfo))| {
            if texinfo >= 0 && texinfo as usize >= numtexinfo {
                return Err(LoadError::BadTexinfo {
                    name: r.name.to_string(),
                    index,
                    texinfo,
                    numtexinfo,
                });
            }
            Ok(CBrushSide {
                plane_idx,
                surface_idx: (texinfo >= 0).then_some(texinfo as usize),
            })
        })
        .collect()
}

fn load_submodels(r: &LumpReader) -> Result<Vec<CModel>, LoadError> {
    let raw = r.records(LUMP_MODELS, DMODEL_SIZE, MAX_MAP_MODELS, |rec| {
        let mut mins = read_vec3(rec, 0);
        let mut maxs = read_vec3(rec, 12);
        // spread the bounds by a pixel
        for j in 0..3 {
            mins[j] -= 1.0;
            maxs[j] += 1.0;
        }
        (mins, maxs, read_vec3(rec, 24), read_i32_le(rec, 36))
    })?;
    if raw.is_empty() {
        return Err(LoadError::Empty {
            name: r.name.to_string(),
            lump: lump_name(LUMP_MODELS),
        });
    }

    raw.into_iter()
        .enumerate()
        .map(|(index, (mins, maxs, origin, headnode))| {
            let headnode = usize::try_from(headnode).map_err(|_| LoadError::BadHeadnode {
                name: r.name.to_string(),
                index,
                headnode,
            })?;
            Ok(CModel {
                mins,
                maxs,
                origin,
                headnode,
            })
        })
        .collect()
}

fn load_entity_string(r: &LumpReader) -> Result<String, LoadError> {
    let bytes = r.bytes(LUMP_ENTITIES)?;
    if bytes.len() > MAX_MAP_ENTSTRING {
        return Err(LoadError::TooMany {
            name: r.name.to_string(),
            lump: lump_name(LUMP_ENTITIES),
            count: bytes.len(),
            max: MAX_MAP_ENTSTRING,
        });
    }
    let text = String::from_utf8_lossy(bytes);
    Ok(text.trim_end_matches('\0').to_string())
}

// ============================================================
// Map loading
// ============================================================

/// Decodes the collision lumps of an IBSP buffer into geometry tables.
pub fn parse_map(name: &str, data: &[u8]) -> Result<MapData, LoadError> {
    let header = read_header(name, data)?;
    let r = LumpReader {
        name,
        data,
        header: &header,
    };

    let surfaces = load_surfaces(&r)?;
    let leafs = load_leafs(&r)?;
    let leafbrushes = load_leaf_brushes(&r)?;
    let planes = load_planes(&r)?;
    let brushes = load_brushes(&r)?;
    let brushsides = load_brush_sides(&r, surfaces.len())?;
    let models = load_submodels(&r)?;
    let nodes = load_nodes(&r)?;
    let entity_string = load_entity_string(&r)?;

    Ok(MapData {
        planes,
        nodes,
        leafs,
        leafbrushes,
        brushes,
        brushsides,
        surfaces,
        models,
        entity_string,
    })
}

/// Loads a map into a ready collision context. Also returns the file checksum.
pub fn load_map(name: &str, data: &[u8], cfg: &CollisionConfig) -> Result<(CModelContext, u32), LoadError> {
    let map = parse_map(name, data)?;
    let checksum = map_checksum(data);

    tracing::info!(
        map = name,
        planes = map.planes.len(),
        nodes = map.nodes.len(),
        leafs = map.leafs.len(),
        brushes = map.brushes.len(),
        models = map.models.len(),
        checksum,
        "loaded collision map"
    );
    Ok((CModelContext::from_map(name, map, cfg), checksum))
}

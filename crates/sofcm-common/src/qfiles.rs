// qfiles.rs -- IBSP v38 on-disk layout used by the collision loader

// ============================================================
// BSP file format
// ============================================================

/// BSP magic: "IBSP" in little-endian
pub const IDBSPHEADER: i32 =
    (b'P' as i32) << 24 | (b'S' as i32) << 16 | (b'B' as i32) << 8 | b'I' as i32;
pub const BSPVERSION: i32 = 38;

// Upper design bounds
pub const MAX_MAP_MODELS: usize = 1024;
pub const MAX_MAP_BRUSHES: usize = 8192;
pub const MAX_MAP_ENTSTRING: usize = 0x40000;
pub const MAX_MAP_TEXINFO: usize = 8192;
pub const MAX_MAP_PLANES: usize = 65536;
pub const MAX_MAP_NODES: usize = 65536;
pub const MAX_MAP_BRUSHSIDES: usize = 65536;
pub const MAX_MAP_LEAFS: usize = 65536;
pub const MAX_MAP_LEAFBRUSHES: usize = 65536;

// Lump indices
pub const LUMP_ENTITIES: usize = 0;
pub const LUMP_PLANES: usize = 1;
pub const LUMP_VERTEXES: usize = 2;
pub const LUMP_VISIBILITY: usize = 3;
pub const LUMP_NODES: usize = 4;
pub const LUMP_TEXINFO: usize = 5;
pub const LUMP_FACES: usize = 6;
pub const LUMP_LIGHTING: usize = 7;
pub const LUMP_LEAFS: usize = 8;
pub const LUMP_LEAFFACES: usize = 9;
pub const LUMP_LEAFBRUSHES: usize = 10;
pub const LUMP_EDGES: usize = 11;
pub const LUMP_SURFEDGES: usize = 12;
pub const LUMP_MODELS: usize = 13;
pub const LUMP_BRUSHES: usize = 14;
pub const LUMP_BRUSHSIDES: usize = 15;
pub const LUMP_POP: usize = 16;
pub const LUMP_AREAS: usize = 17;
pub const LUMP_AREAPORTALS: usize = 18;
pub const HEADER_LUMPS: usize = 19;

/// ident + version + lump directory
pub const HEADER_SIZE: usize = 8 + HEADER_LUMPS * 8;

// Element sizes of the lumps the collision model reads.
// dplane_t: normal[3] + dist + type
pub const DPLANE_SIZE: usize = 20;
// dnode_t: planenum + children[2] + mins[3]/maxs[3] (i16) + firstface + numfaces
pub const DNODE_SIZE: usize = 28;
// texinfo_t: vecs[2][4] + flags + value + texture[32] + nexttexinfo
pub const TEXINFO_SIZE: usize = 76;
// dleaf_t: contents + cluster + area + mins/maxs (i16) + leaffaces + leafbrushes
pub const DLEAF_SIZE: usize = 28;
pub const DLEAFBRUSH_SIZE: usize = 2;
// dmodel_t: mins + maxs + origin + headnode + firstface + numfaces
pub const DMODEL_SIZE: usize = 48;
// dbrush_t: firstside + numsides + contents
pub const DBRUSH_SIZE: usize = 12;
// dbrushside_t: planenum (u16) + texinfo (i16)
pub const DBRUSHSIDE_SIZE: usize = 4;

/// Human readable lump name for diagnostics.
pub fn lump_name(lump: usize) -> &'static str {
    match lump {
        LUMP_ENTITIES => "entities",
        LUMP_PLANES => "planes",
        LUMP_VERTEXES => "vertexes",
        LUMP_VISIBILITY => "visibility",
        LUMP_NODES => "nodes",
        LUMP_TEXINFO => "texinfo",
        LUMP_FACES => "faces",
        LUMP_LIGHTING => "lighting",
        LUMP_LEAFS => "leafs",
        LUMP_LEAFFACES => "leaffaces",
        LUMP_LEAFBRUSHES => "leafbrushes",
        LUMP_EDGES => "edges",
        LUMP_SURFEDGES => "surfedges",
        LUMP_MODELS => "models",
        LUMP_BRUSHES => "brushes",
        LUMP_BRUSHSIDES => "brushsides",
        LUMP_POP => "pop",
        LUMP_AREAS => "areas",
        LUMP_AREAPORTALS => "areaportals",
        _ => "unknown",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lump {
    pub fileofs: i32,
    pub filelen: i32,
}

#[derive(Debug, Clone, Copy)]
pub struct DHeader {
    pub ident: i32,
    pub version: i32,
    pub lumps: [Lump; HEADER_LUMPS],
}

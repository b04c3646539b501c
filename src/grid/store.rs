use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::info;

use super::{GeometryTable, RingDescriptor};

const MAGIC: &[u8; 4] = b"SKYG";
const VERSION: u32 = 1;

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

impl GeometryTable {
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file = File::create(path)?;
        let mut w = BufWriter::new(file);
        self.write_to(&mut w)?;
        w.flush()
    }

    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(MAGIC)?;
        write_u32(w, VERSION)?;
        write_u64(w, self.rings.len() as u64)?;
        write_u32(w, self.pad)?;

        for ring in &self.rings {
            write_f64(w, ring.dec_min)?;
            write_f64(w, ring.dec_max)?;
            write_f64(w, ring.dec_center)?;
            write_u32(w, ring.band_count)?;
            write_u32(w, ring.base_cell_id)?;
            write_u32(w, ring.cell_width_px)?;
            write_u32(w, ring.cell_height_px)?;
            write_f64(w, ring.ref_pixel_x)?;
            write_f64(w, ring.ref_pixel_y)?;
        }
        Ok(())
    }

    pub fn load(path: &Path) -> io::Result<GeometryTable> {
        let file = File::open(path)?;
        let table = Self::read_from(&mut BufReader::new(file))?;
        info!(
            path = %path.display(),
            rings = table.len(),
            cells = table.cell_id_end(),
            "loaded geometry table"
        );
        Ok(table)
    }

    pub fn read_from(r: &mut impl Read) -> io::Result<GeometryTable> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid magic bytes",
            ));
        }

        let version = read_u32(r)?;
        if version != VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported version: {version}"),
            ));
        }

        let num_rings = read_u64(r)? as usize;
        let pad = read_u32(r)?;

        // Cap the preallocation; a corrupt count fails on read_exact instead.
        let mut rings = Vec::with_capacity(num_rings.min(4096));
        for _ in 0..num_rings {
            rings.push(RingDescriptor {
                dec_min: read_f64(r)?,
                dec_max: read_f64(r)?,
                dec_center: read_f64(r)?,
                band_count: read_u32(r)?,
                base_cell_id: read_u32(r)?,
                cell_width_px: read_u32(r)?,
                cell_height_px: read_u32(r)?,
                ref_pixel_x: read_f64(r)?,
                ref_pixel_y: read_f64(r)?,
            });
        }

        GeometryTable::new(rings, pad)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

//! Model snapshot persistence, safetensors format.

use std::path::Path;

use safetensors::{
    SafeTensors, serialize,
    tensor::{Dtype, TensorView},
};

use super::GaussianStore;
use crate::error::{Result, ServerErr};

const POSITIONS: &str = "positions";
const LOG_SCALES: &str = "log_scales";
const ROTATIONS: &str = "rotations";
const OPACITIES: &str = "opacities";
const COLORS: &str = "colors";

fn snapshot_err(detail: impl ToString) -> ServerErr {
    ServerErr::Snapshot {
        detail: detail.to_string(),
    }
}

/// Serializes the store's unit arrays into a safetensors buffer.
///
/// Accumulators are deliberately not persisted: a loaded model always
/// starts with fresh optimizer state.
pub fn to_bytes(store: &GaussianStore) -> Result<Vec<u8>> {
    if !store.is_initialized() {
        return Err(ServerErr::MissingModel);
    }

    let n = store.len();
    let tensors = [
        (POSITIONS, vec![n, 3], bytemuck::cast_slice(store.positions())),
        (LOG_SCALES, vec![n, 3], bytemuck::cast_slice(store.log_scales())),
        (ROTATIONS, vec![n, 4], bytemuck::cast_slice(store.rotations())),
        (OPACITIES, vec![n], bytemuck::cast_slice(store.opacities())),
        (COLORS, vec![n, 3], bytemuck::cast_slice(store.colors())),
    ];

    let views = tensors
        .into_iter()
        .map(|(name, shape, data)| {
            TensorView::new(Dtype::F32, shape, data).map(|view| (name, view))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(snapshot_err)?;

    serialize(views, &None).map_err(snapshot_err)
}

/// Rebuilds a store from a safetensors buffer, with zeroed
/// accumulators.
pub fn from_bytes(bytes: &[u8]) -> Result<GaussianStore> {
    let tensors = SafeTensors::deserialize(bytes).map_err(snapshot_err)?;

    let positions = read_vec3(&tensors, POSITIONS)?;
    let log_scales = read_vec3(&tensors, LOG_SCALES)?;
    let rotations = read_vec4(&tensors, ROTATIONS)?;
    let opacities = read_scalars(&tensors, OPACITIES)?;
    let colors = read_vec3(&tensors, COLORS)?;

    GaussianStore::from_parts(positions, log_scales, rotations, opacities, colors)
}

/// Writes the model snapshot to `path`.
pub fn save(store: &GaussianStore, path: impl AsRef<Path>) -> Result<()> {
    let bytes = to_bytes(store)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Loads a model snapshot from `path`.
pub fn load(path: impl AsRef<Path>) -> Result<GaussianStore> {
    let bytes = std::fs::read(path)?;
    from_bytes(&bytes)
}

fn read_floats(tensors: &SafeTensors, name: &str, inner: usize) -> Result<Vec<f32>> {
    let view = tensors.tensor(name).map_err(snapshot_err)?;

    if view.dtype() != Dtype::F32 {
        return Err(snapshot_err(format!("tensor {name} is not f32")));
    }

    let shape_ok = match inner {
        1 => view.shape().len() == 1,
        d => view.shape().len() == 2 && view.shape()[1] == d,
    };
    if !shape_ok {
        return Err(snapshot_err(format!(
            "tensor {name} has unexpected shape {:?}",
            view.shape()
        )));
    }

    // safetensors payloads are little-endian and unaligned; decode by
    // copy instead of reinterpreting the mapped bytes.
    Ok(view
        .data()
        .chunks_exact(size_of::<f32>())
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn read_scalars(tensors: &SafeTensors, name: &str) -> Result<Vec<f32>> {
    read_floats(tensors, name, 1)
}

fn read_vec3(tensors: &SafeTensors, name: &str) -> Result<Vec<[f32; 3]>> {
    let flat = read_floats(tensors, name, 3)?;
    Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
}

fn read_vec4(tensors: &SafeTensors, name: &str) -> Result<Vec<[f32; 4]>> {
    let flat = read_floats(tensors, name, 4)?;
    Ok(flat
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip_restores_units_with_fresh_accumulators() {
        let points: Vec<[f32; 3]> = (0..6).map(|i| [i as f32, 1.0, -1.0]).collect();
        let colors = vec![[0.25, 0.5, 0.75]; 6];
        let mut store = GaussianStore::default();
        store.create_from_seed(&points, &colors);
        store.accumulate(2, 3.5, 1.0);

        let bytes = to_bytes(&store).unwrap();
        let loaded = from_bytes(&bytes).unwrap();

        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.positions(), store.positions());
        assert_eq!(loaded.colors(), store.colors());
        assert_eq!(loaded.aux_lens(), [6; 3]);
        assert!(loaded.is_initialized());
    }

    #[test]
    fn saving_an_uninitialized_store_is_an_error() {
        let store = GaussianStore::default();
        assert!(matches!(to_bytes(&store), Err(ServerErr::MissingModel)));
    }

    #[test]
    fn corrupt_bytes_are_a_snapshot_error() {
        assert!(matches!(
            from_bytes(b"not a safetensors file"),
            Err(ServerErr::Snapshot { .. })
        ));
    }
}

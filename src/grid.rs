use std::{fmt::Debug, str::FromStr, sync::Arc};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{runtime::DeviceId, shape::Shape};

#[derive(Debug, Error)]
pub enum GridError {
    #[error("device grid needs at least one device")]
    NoDevices,
    #[error("cluster shape {0} has an empty axis")]
    EmptyClusterAxis(Shape),
    #[error("unknown device grid `{0}`; supported are `cyclic` and `packed`")]
    Parse(String),
}

/// Deterministic placement of the blocks of an array onto devices.
///
/// The cluster shape only drives block sizing; placement walks the flat device list.
pub trait DeviceGrid: Debug + Send + Sync {
    /// Shape of the cluster used when sizing blocks.
    fn cluster_shape(&self) -> &Shape;

    /// Ordered list of devices blocks are placed on.
    fn devices(&self) -> &[DeviceId];

    /// The device of the block at `coord` of an array whose grid is `grid_shape`.
    fn get_device(&self, coord: &[usize], grid_shape: &[usize]) -> DeviceId;

    /// The cluster shape seen by an array of `ndim` axes.
    /// Excess axes are dropped and missing axes have size 1.
    fn cluster_shape_for(&self, ndim: usize) -> Shape {
        let cluster = self.cluster_shape();
        (0..ndim)
            .map(|axis| cluster.get(axis).copied().unwrap_or(1))
            .collect::<Vec<_>>()
            .into()
    }
}

fn validate(cluster_shape: &Shape, devices: &[DeviceId]) -> Result<(), GridError> {
    if devices.is_empty() {
        return Err(GridError::NoDevices);
    }
    if cluster_shape.contains(&0) {
        return Err(GridError::EmptyClusterAxis(cluster_shape.clone()));
    }
    Ok(())
}

/// Deals blocks to devices round-robin in row-major order.
#[derive(Debug, Clone)]
pub struct CyclicDeviceGrid {
    cluster_shape: Shape,
    devices: Vec<DeviceId>,
}

impl CyclicDeviceGrid {
    pub fn new(cluster_shape: impl Into<Shape>, devices: Vec<DeviceId>) -> Result<Self, GridError> {
        let cluster_shape = cluster_shape.into();
        validate(&cluster_shape, &devices)?;
        Ok(Self {
            cluster_shape,
            devices,
        })
    }
}

impl DeviceGrid for CyclicDeviceGrid {
    #[inline]
    fn cluster_shape(&self) -> &Shape {
        &self.cluster_shape
    }

    #[inline]
    fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    fn get_device(&self, coord: &[usize], grid_shape: &[usize]) -> DeviceId {
        let index = Shape::from(grid_shape).flatten(coord);
        self.devices[index % self.devices.len()]
    }
}

/// Hands each device one contiguous row-major range of blocks,
/// so that neighbouring blocks share a device.
#[derive(Debug, Clone)]
pub struct PackedDeviceGrid {
    cluster_shape: Shape,
    devices: Vec<DeviceId>,
}

impl PackedDeviceGrid {
    pub fn new(cluster_shape: impl Into<Shape>, devices: Vec<DeviceId>) -> Result<Self, GridError> {
        let cluster_shape = cluster_shape.into();
        validate(&cluster_shape, &devices)?;
        Ok(Self {
            cluster_shape,
            devices,
        })
    }
}

impl DeviceGrid for PackedDeviceGrid {
    #[inline]
    fn cluster_shape(&self) -> &Shape {
        &self.cluster_shape
    }

    #[inline]
    fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    fn get_device(&self, coord: &[usize], grid_shape: &[usize]) -> DeviceId {
        let grid_shape = Shape::from(grid_shape);
        let index = grid_shape.flatten(coord);
        let total = grid_shape.size().max(1);
        self.devices[index * self.devices.len() / total]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum GridKind {
    #[default]
    #[display("cyclic")]
    Cyclic,
    #[display("packed")]
    Packed,
}

impl FromStr for GridKind {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cyclic" => Ok(Self::Cyclic),
            "packed" => Ok(Self::Packed),
            _ => Err(GridError::Parse(s.into())),
        }
    }
}

impl GridKind {
    pub fn build(
        self,
        cluster_shape: impl Into<Shape>,
        devices: Vec<DeviceId>,
    ) -> Result<Arc<dyn DeviceGrid>, GridError> {
        let grid: Arc<dyn DeviceGrid> = match self {
            GridKind::Cyclic => Arc::new(CyclicDeviceGrid::new(cluster_shape, devices)?),
            GridKind::Packed => Arc::new(PackedDeviceGrid::new(cluster_shape, devices)?),
        };
        Ok(grid)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::{CyclicDeviceGrid, DeviceGrid, GridKind, PackedDeviceGrid};
    use crate::{runtime::DeviceId, shape::Shape};

    fn devices(n: usize) -> Vec<DeviceId> {
        (0..n).map(DeviceId).collect()
    }

    #[test]
    fn test_cyclic_balance() -> Result<(), Box<dyn Error>> {
        for n in 1..=7 {
            let grid = CyclicDeviceGrid::new([2, 2], devices(n))?;
            for grid_shape in [vec![5], vec![3, 4], vec![2, 3, 5], vec![1, 7]] {
                let coords = Shape::from(grid_shape.clone()).coords().collect_vec();
                let first = coords
                    .iter()
                    .map(|coord| grid.get_device(coord, &grid_shape))
                    .collect_vec();
                let second = coords
                    .iter()
                    .map(|coord| grid.get_device(coord, &grid_shape))
                    .collect_vec();
                assert_eq!(first, second);

                let counts = first.iter().counts();
                let all = devices(n);
                let loads = all.iter().map(|d| counts.get(d).copied().unwrap_or(0));
                let (min, max) = loads.minmax().into_option().unwrap_or((0, 0));
                assert!(max - min <= 1, "{n} devices, grid {grid_shape:?}");
            }
        }
        Ok(())
    }

    #[test]
    fn test_packed_contiguous() -> Result<(), Box<dyn Error>> {
        let grid = PackedDeviceGrid::new([4], devices(4))?;
        let grid_shape = [8];
        let placement = (0..8)
            .map(|x| grid.get_device(&[x], &grid_shape).0)
            .collect_vec();
        assert_eq!(placement, vec![0, 0, 1, 1, 2, 2, 3, 3]);

        // the leading axis is shorter than the device count
        let grid_shape = [2, 4];
        let placement = Shape::from(grid_shape)
            .coords()
            .map(|coord| grid.get_device(&coord, &grid_shape).0)
            .collect_vec();
        assert_eq!(placement, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        Ok(())
    }

    #[test]
    fn test_placement_ignores_cluster_shape() -> Result<(), Box<dyn Error>> {
        let grid_shape = [3, 4];
        for kind in [GridKind::Cyclic, GridKind::Packed] {
            let square = kind.build([2, 2], devices(4))?;
            let flat = kind.build([4], devices(4))?;
            for coord in Shape::from(grid_shape).coords() {
                assert_eq!(
                    square.get_device(&coord, &grid_shape),
                    flat.get_device(&coord, &grid_shape)
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_cluster_shape_for() -> Result<(), Box<dyn Error>> {
        let grid = GridKind::Cyclic.build([2, 3], devices(6))?;
        assert_eq!(grid.cluster_shape_for(1), Shape::from([2]));
        assert_eq!(grid.cluster_shape_for(3), Shape::from([2, 3, 1]));
        assert!("spiral".parse::<GridKind>().is_err());
        assert!(GridKind::Packed.build([0], devices(1)).is_err());
        assert!(GridKind::Packed.build([1], vec![]).is_err());
        Ok(())
    }
}

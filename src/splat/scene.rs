//! Scene contract consumed by `ComputeEngine::compile`.

use std::collections::HashMap;

use glam::Mat4;

use super::point::GaussianPoint;

/// Host-side entity handle owning a transform
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity(pub u32);

/// How a run of consecutive Gaussians maps to transform slots
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SplatGroup {
    /// `len` Gaussians sharing the entity's transform (one slot)
    Shared { entity: Entity, len: u32 },
    /// One Gaussian per entity, each with its own slot
    Individual { entities: Vec<Entity> },
}

impl SplatGroup {
    pub fn len(&self) -> u32 {
        match self {
            SplatGroup::Shared { len, .. } => *len,
            SplatGroup::Individual { entities } => entities.len() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the engine reads from a scene
pub trait SplatScene {
    fn gaussian_count(&self) -> u32;

    /// All Gaussian records, flattened in group order
    fn point_bytes(&self) -> &[u8];

    /// Groups in upload order; their lengths sum to `gaussian_count`
    fn groups(&self) -> &[SplatGroup];

    /// Index of the entity's matrix in `transforms()`
    fn transform_index(&self, entity: Entity) -> Option<u32>;

    /// Host transform table
    fn transforms(&self) -> &[Mat4];
}

/// Owned point cloud with per-group instance transforms
#[derive(Clone, Debug, Default)]
pub struct PointCloud {
    points: Vec<GaussianPoint>,
    groups: Vec<SplatGroup>,
    transforms: Vec<Mat4>,
    entity_transforms: HashMap<Entity, u32>,
}

impl PointCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// One shared group under the identity transform
    pub fn from_points(points: Vec<GaussianPoint>) -> Self {
        let mut cloud = Self::new();
        cloud.push_group(points, Mat4::IDENTITY);
        cloud
    }

    fn new_entity(&mut self, transform: Mat4) -> Entity {
        let entity = Entity(self.entity_transforms.len() as u32);
        self.entity_transforms.insert(entity, self.transforms.len() as u32);
        self.transforms.push(transform);
        entity
    }

    /// Append Gaussians that move together under one transform
    pub fn push_group(&mut self, points: Vec<GaussianPoint>, transform: Mat4) -> Entity {
        let entity = self.new_entity(transform);
        self.groups.push(SplatGroup::Shared {
            entity,
            len: points.len() as u32,
        });
        self.points.extend(points);
        entity
    }

    /// Append a Gaussian with a transform of its own
    pub fn push_individual(&mut self, point: GaussianPoint, transform: Mat4) -> Entity {
        let entity = self.new_entity(transform);
        match self.groups.last_mut() {
            Some(SplatGroup::Individual { entities }) => entities.push(entity),
            _ => self.groups.push(SplatGroup::Individual {
                entities: vec![entity],
            }),
        }
        self.points.push(point);
        entity
    }

    pub fn set_transform(&mut self, entity: Entity, transform: Mat4) -> bool {
        match self.entity_transforms.get(&entity) {
            Some(&index) => {
                self.transforms[index as usize] = transform;
                true
            }
            None => false,
        }
    }

    pub fn transform(&self, entity: Entity) -> Option<Mat4> {
        let index = *self.entity_transforms.get(&entity)?;
        self.transforms.get(index as usize).copied()
    }

    /// Every entity, in creation order
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        (0..self.entity_transforms.len() as u32).map(Entity)
    }

    pub fn points(&self) -> &[GaussianPoint] {
        &self.points
    }
}

impl SplatScene for PointCloud {
    fn gaussian_count(&self) -> u32 {
        self.points.len() as u32
    }

    fn point_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.points)
    }

    fn groups(&self) -> &[SplatGroup] {
        &self.groups
    }

    fn transform_index(&self, entity: Entity) -> Option<u32> {
        self.entity_transforms.get(&entity).copied()
    }

    fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_individuals_merge_into_one_group() {
        let mut cloud = PointCloud::new();
        cloud.push_group(vec![GaussianPoint::default(); 3], Mat4::IDENTITY);
        let a = cloud.push_individual(GaussianPoint::default(), Mat4::IDENTITY);
        let b = cloud.push_individual(GaussianPoint::default(), Mat4::IDENTITY);

        assert_eq!(cloud.gaussian_count(), 5);
        assert_eq!(cloud.groups().len(), 2);
        assert_eq!(
            cloud.groups()[1],
            SplatGroup::Individual {
                entities: vec![a, b]
            }
        );
        assert_eq!(cloud.point_bytes().len(), 5 * 240);
    }

    #[test]
    fn test_set_transform_updates_table() {
        let mut cloud = PointCloud::new();
        let entity = cloud.push_group(vec![GaussianPoint::default()], Mat4::IDENTITY);
        let moved = Mat4::from_translation(glam::Vec3::X);
        assert!(cloud.set_transform(entity, moved));
        let index = cloud.transform_index(entity).unwrap();
        assert_eq!(cloud.transforms()[index as usize], moved);
        assert!(!cloud.set_transform(Entity(99), moved));
        assert_eq!(cloud.transform(entity), Some(moved));
        assert_eq!(cloud.entities().collect::<Vec<_>>(), vec![entity]);
    }
}

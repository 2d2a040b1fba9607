use xxhash_rust::xxh3::xxh3_64;

use super::{MAX_CBS, MAX_SAMPLERS, MAX_SRVS, MAX_UAVS};

/// Content-derived identity of a root signature. Equal layouts share an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RootSignatureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootSignatureKind {
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorRangeType {
    Srv,
    Uav,
    Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootParameter {
    DescriptorTable(DescriptorRangeType),
    /// Root CBV.
    ConstantBuffer,
    /// Root SRV (raw buffer address).
    ShaderResource,
    Constants { num_dwords: u32 },
}

impl RootParameter {
    /// Bytes the parameter occupies in a local record.
    #[must_use]
    pub fn size_in_bytes(self) -> u32 {
        match self {
            Self::DescriptorTable(_) | Self::ConstantBuffer | Self::ShaderResource => 8,
            Self::Constants { num_dwords } => num_dwords * 4,
        }
    }

    #[must_use]
    fn alignment(self) -> u32 {
        match self {
            Self::Constants { .. } => 4,
            _ => 8,
        }
    }

    fn encode(self) -> u32 {
        match self {
            Self::DescriptorTable(DescriptorRangeType::Srv) => 1,
            Self::DescriptorTable(DescriptorRangeType::Uav) => 2,
            Self::DescriptorTable(DescriptorRangeType::Sampler) => 3,
            Self::ConstantBuffer => 4,
            Self::ShaderResource => 5,
            Self::Constants { num_dwords } => 6 | (num_dwords << 8),
        }
    }
}

/// Resources declared by a shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShaderResourceCounts {
    pub num_srvs: u32,
    pub num_uavs: u32,
    pub num_samplers: u32,
    pub num_cbs: u32,
}

impl ShaderResourceCounts {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_srvs == 0 && self.num_uavs == 0 && self.num_samplers == 0 && self.num_cbs == 0
    }

    /// View descriptors (SRVs + UAVs) one binding of this shader consumes.
    #[must_use]
    pub fn view_descriptors(&self) -> u32 {
        self.num_srvs + self.num_uavs
    }
}

/// Root signature layout with precomputed argument offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootSignature {
    id: RootSignatureId,
    kind: RootSignatureKind,
    parameters: Vec<RootParameter>,
    offsets: Vec<u32>,
    total_size: u32,
    srv_table_slot: Option<u32>,
    uav_table_slot: Option<u32>,
    sampler_table_slot: Option<u32>,
    cbv_base_slot: Option<u32>,
    has_system_parameters: bool,
}

impl RootSignature {
    #[must_use]
    pub fn new(kind: RootSignatureKind, parameters: Vec<RootParameter>) -> Self {
        Self::build(kind, parameters, false)
    }

    /// An empty signature. Ray generation and miss collections use the empty
    /// local signature.
    #[must_use]
    pub fn empty(kind: RootSignatureKind) -> Self {
        Self::new(kind, Vec::new())
    }

    /// The standard layout for a shader with the given resources.
    ///
    /// Local layouts are prefixed with the hit group system parameters.
    #[must_use]
    pub fn for_resources(kind: RootSignatureKind, counts: &ShaderResourceCounts) -> Self {
        debug_assert!(counts.num_srvs <= MAX_SRVS);
        debug_assert!(counts.num_uavs <= MAX_UAVS);
        debug_assert!(counts.num_samplers <= MAX_SAMPLERS);
        debug_assert!(counts.num_cbs <= MAX_CBS);

        let mut parameters = Vec::with_capacity(6 + counts.num_cbs as usize);
        let system = kind == RootSignatureKind::Local;
        if system {
            parameters.push(RootParameter::ShaderResource);
            parameters.push(RootParameter::ShaderResource);
            parameters.push(RootParameter::Constants { num_dwords: 4 });
        }
        if counts.num_srvs > 0 {
            parameters.push(RootParameter::DescriptorTable(DescriptorRangeType::Srv));
        }
        if counts.num_uavs > 0 {
            parameters.push(RootParameter::DescriptorTable(DescriptorRangeType::Uav));
        }
        if counts.num_samplers > 0 {
            parameters.push(RootParameter::DescriptorTable(DescriptorRangeType::Sampler));
        }
        parameters.extend((0..counts.num_cbs).map(|_| RootParameter::ConstantBuffer));
        Self::build(kind, parameters, system)
    }

    fn build(kind: RootSignatureKind, parameters: Vec<RootParameter>, has_system_parameters: bool) -> Self {
        let mut offsets = Vec::with_capacity(parameters.len());
        let mut cursor = 0u32;
        let mut srv_table_slot = None;
        let mut uav_table_slot = None;
        let mut sampler_table_slot = None;
        let mut cbv_base_slot = None;

        for (slot, parameter) in parameters.iter().enumerate() {
            let slot = slot as u32;
            cursor = cursor.next_multiple_of(parameter.alignment());
            offsets.push(cursor);
            cursor += parameter.size_in_bytes();

            match parameter {
                RootParameter::DescriptorTable(DescriptorRangeType::Srv) => {
                    srv_table_slot.get_or_insert(slot);
                }
                RootParameter::DescriptorTable(DescriptorRangeType::Uav) => {
                    uav_table_slot.get_or_insert(slot);
                }
                RootParameter::DescriptorTable(DescriptorRangeType::Sampler) => {
                    sampler_table_slot.get_or_insert(slot);
                }
                RootParameter::ConstantBuffer => {
                    cbv_base_slot.get_or_insert(slot);
                }
                _ => {}
            }
        }

        let mut encoded = Vec::with_capacity(parameters.len() + 1);
        encoded.push(match kind {
            RootSignatureKind::Global => 0u32,
            RootSignatureKind::Local => 1,
        });
        encoded.extend(parameters.iter().map(|p| p.encode()));
        let id = RootSignatureId(xxh3_64(bytemuck::cast_slice(&encoded)));

        Self {
            id,
            kind,
            parameters,
            offsets,
            total_size: cursor,
            srv_table_slot,
            uav_table_slot,
            sampler_table_slot,
            cbv_base_slot,
            has_system_parameters,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> RootSignatureId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> RootSignatureKind {
        self.kind
    }

    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[RootParameter] {
        &self.parameters
    }

    /// Size of the local argument block.
    #[inline]
    #[must_use]
    pub fn total_size_in_bytes(&self) -> u32 {
        self.total_size
    }

    /// Byte offset of a parameter inside the local argument block.
    #[inline]
    #[must_use]
    pub fn bind_slot_offset(&self, slot: u32) -> u32 {
        self.offsets[slot as usize]
    }

    #[must_use]
    pub fn table_slot(&self, range: DescriptorRangeType) -> Option<u32> {
        match range {
            DescriptorRangeType::Srv => self.srv_table_slot,
            DescriptorRangeType::Uav => self.uav_table_slot,
            DescriptorRangeType::Sampler => self.sampler_table_slot,
        }
    }

    /// Root slot of constant buffer `index`, if the signature declares it.
    #[must_use]
    pub fn cbv_slot(&self, index: u32) -> Option<u32> {
        let base = self.cbv_base_slot?;
        let slot = base + index;
        matches!(
            self.parameters.get(slot as usize),
            Some(RootParameter::ConstantBuffer)
        )
        .then_some(slot)
    }

    /// Whether the layout starts with hit group system parameters.
    #[inline]
    #[must_use]
    pub fn has_system_parameters(&self) -> bool {
        self.has_system_parameters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_layout_starts_with_system_parameters() {
        let counts = ShaderResourceCounts {
            num_srvs: 2,
            num_uavs: 0,
            num_samplers: 1,
            num_cbs: 2,
        };
        let sig = RootSignature::for_resources(RootSignatureKind::Local, &counts);

        assert!(sig.has_system_parameters());
        assert_eq!(sig.bind_slot_offset(0), 0);
        assert_eq!(sig.bind_slot_offset(1), 8);
        assert_eq!(sig.bind_slot_offset(2), 16);

        let srv = sig.table_slot(DescriptorRangeType::Srv).unwrap();
        assert_eq!(sig.bind_slot_offset(srv), 32);
        assert_eq!(sig.table_slot(DescriptorRangeType::Uav), None);
        let sampler = sig.table_slot(DescriptorRangeType::Sampler).unwrap();
        assert_eq!(sig.bind_slot_offset(sampler), 40);
        assert_eq!(sig.cbv_slot(1).map(|s| sig.bind_slot_offset(s)), Some(56));
        assert_eq!(sig.cbv_slot(2), None);
        assert_eq!(sig.total_size_in_bytes(), 64);
    }

    #[test]
    fn equal_layouts_share_identity() {
        let counts = ShaderResourceCounts {
            num_cbs: 1,
            ..Default::default()
        };
        let a = RootSignature::for_resources(RootSignatureKind::Global, &counts);
        let b = RootSignature::for_resources(RootSignatureKind::Global, &counts);
        let c = RootSignature::for_resources(RootSignatureKind::Local, &counts);
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn constants_pack_on_dword_boundaries() {
        let sig = RootSignature::new(
            RootSignatureKind::Local,
            vec![
                RootParameter::Constants { num_dwords: 1 },
                RootParameter::ConstantBuffer,
            ],
        );
        assert_eq!(sig.bind_slot_offset(0), 0);
        assert_eq!(sig.bind_slot_offset(1), 8);
        assert_eq!(sig.total_size_in_bytes(), 16);
    }
}

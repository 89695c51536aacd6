//! GATT layout of the LoggingScale firmware.
//!
//! One primary service carrying six characteristics. Handles are resolved from a
//! discovered service list once per connection.

use crate::error::TransportError;
use uuid::Uuid;

pub const SCALE_SERVICE_UUID: Uuid = Uuid::from_u128(0x1eb9bb89_186e_4d2a_a204_346da73c061c);
pub const MASS_CHAR_UUID: Uuid = Uuid::from_u128(0x5977b71a_a58c_40d2_85a4_34071043d9ca);
pub const TARE_CHAR_UUID: Uuid = Uuid::from_u128(0xa8f2d9f3_c93a_4479_8208_7287262eacf6);
pub const TARGET_MASS_CHAR_UUID: Uuid = Uuid::from_u128(0xbcf25166_c8d1_4421_805f_0d277cbfb82e);
pub const LOGGING_CHAR_UUID: Uuid = Uuid::from_u128(0x9fdd73d8_77e8_4099_816f_a1619834c3f2);
pub const SHOT_STATE_CHAR_UUID: Uuid = Uuid::from_u128(0xc4fc31b7_0442_4ed8_861f_08c5e8843eb7);
pub const LOG_STATE_CHAR_UUID: Uuid = Uuid::from_u128(0x101305d0_ebd3_4862_b816_a12f7694f498);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharRole {
    Mass,
    Tare,
    TargetMass,
    Logging,
    ShotState,
    LogState,
}

impl CharRole {
    pub fn all() -> [CharRole; 6] {
        [
            CharRole::Mass,
            CharRole::Tare,
            CharRole::TargetMass,
            CharRole::Logging,
            CharRole::ShotState,
            CharRole::LogState,
        ]
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            CharRole::Mass => MASS_CHAR_UUID,
            CharRole::Tare => TARE_CHAR_UUID,
            CharRole::TargetMass => TARGET_MASS_CHAR_UUID,
            CharRole::Logging => LOGGING_CHAR_UUID,
            CharRole::ShotState => SHOT_STATE_CHAR_UUID,
            CharRole::LogState => LOG_STATE_CHAR_UUID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CharRole::Mass => "mass",
            CharRole::Tare => "tare",
            CharRole::TargetMass => "target mass",
            CharRole::Logging => "logging feed",
            CharRole::ShotState => "shot state",
            CharRole::LogState => "log state",
        }
    }

    /// Characteristics the session subscribes to once ready
    pub fn is_notify(&self) -> bool {
        matches!(self, CharRole::Mass | CharRole::Logging | CharRole::ShotState)
    }
}

/// Reference to one resolved characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub role: CharRole,
    pub service: Uuid,
    pub uuid: Uuid,
}

/// A discovered service as reported by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Handles for all six roles, valid for a single connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleCharacteristics {
    handles: [CharacteristicHandle; 6],
}

impl ScaleCharacteristics {
    /// Resolve every role from the scale service.
    ///
    /// Fails on the first missing piece, naming it.
    pub fn resolve(services: &[GattService]) -> Result<Self, TransportError> {
        let service = services
            .iter()
            .find(|s| s.uuid == SCALE_SERVICE_UUID)
            .ok_or(TransportError::MissingCharacteristic("scale service"))?;

        let mut handles = Vec::with_capacity(6);
        for role in CharRole::all() {
            if !service.characteristics.contains(&role.uuid()) {
                return Err(TransportError::MissingCharacteristic(role.name()));
            }
            handles.push(CharacteristicHandle {
                role,
                service: service.uuid,
                uuid: role.uuid(),
            });
        }

        let handles = handles
            .try_into()
            .map_err(|_| TransportError::MissingCharacteristic("scale service"))?;
        Ok(Self { handles })
    }

    pub fn get(&self, role: CharRole) -> CharacteristicHandle {
        // resolve() fills the array in CharRole::all() order
        self.handles[role as usize]
    }

    pub fn role_of(&self, uuid: Uuid) -> Option<CharRole> {
        self.handles.iter().find(|h| h.uuid == uuid).map(|h| h.role)
    }

    pub fn notify_handles(&self) -> impl Iterator<Item = CharacteristicHandle> + '_ {
        self.handles.iter().copied().filter(|h| h.role.is_notify())
    }
}

#[cfg(test)]
pub(crate) fn scale_service() -> GattService {
    GattService {
        uuid: SCALE_SERVICE_UUID,
        characteristics: CharRole::all().iter().map(|r| r.uuid()).collect(),
    }
}

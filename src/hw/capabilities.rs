use serde::Serialize;
use strum::IntoEnumIterator;
use tracing::{debug, instrument};

use super::model::{GattCharacteristic, GattService};
use crate::error::InteractionError;
use crate::protocol::{self, RoleId};

/// Characteristics bound to the Bluno roles after one discovery.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct RoleBindings {
    identity: Option<GattCharacteristic>,
    serial: Option<GattCharacteristic>,
    command: Option<GattCharacteristic>,
}

impl RoleBindings {
    /// Classifies every catalogued characteristic into the role bindings.
    ///
    /// When a role UUID appears in more than one service the last occurrence wins.
    #[must_use]
    #[instrument(skip(services), level = "debug", fields(service_count = services.len()))]
    pub fn resolve(services: &[GattService]) -> Self {
        let mut bindings = Self::default();
        for characteristic in services.iter().flat_map(GattService::characteristics) {
            let Some(role) = protocol::role_for_uuid(characteristic.uuid()) else {
                continue;
            };
            debug!(%role, uuid = characteristic.uuid(), "bound characteristic to role");
            *bindings.slot_mut(role) = Some(characteristic.clone());
        }
        bindings
    }

    /// Characteristic bound to `role`, if discovered.
    #[must_use]
    pub fn get(&self, role: RoleId) -> Option<&GattCharacteristic> {
        match role {
            RoleId::Identity => self.identity.as_ref(),
            RoleId::Serial => self.serial.as_ref(),
            RoleId::Command => self.command.as_ref(),
        }
    }

    /// True when every role is bound.
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        RoleId::iter().all(|role| self.get(role).is_some())
    }

    #[must_use]
    pub fn missing_roles(&self) -> Vec<RoleId> {
        RoleId::iter().filter(|role| self.get(*role).is_none()).collect()
    }

    /// # Errors
    ///
    /// Returns `IncompatibleDevice` naming every unbound role.
    pub fn ensure_compatible(&self) -> Result<(), InteractionError> {
        let missing = self.missing_roles();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(InteractionError::IncompatibleDevice { missing })
        }
    }

    /// Role whose bound characteristic has `uuid`.
    #[must_use]
    pub fn role_of(&self, uuid: &str) -> Option<RoleId> {
        RoleId::iter().find(|role| {
            self.get(*role)
                .is_some_and(|characteristic| characteristic.uuid().eq_ignore_ascii_case(uuid))
        })
    }

    fn slot_mut(&mut self, role: RoleId) -> &mut Option<GattCharacteristic> {
        match role {
            RoleId::Identity => &mut self.identity,
            RoleId::Serial => &mut self.serial,
            RoleId::Command => &mut self.command,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use btleplug::api::CharPropFlags;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn characteristic(role: RoleId) -> GattCharacteristic {
        let service = match role {
            RoleId::Identity => protocol::DEVICE_INFORMATION_SERVICE_UUID,
            RoleId::Serial | RoleId::Command => protocol::BLUNO_SERVICE_UUID,
        };
        GattCharacteristic::new(
            service,
            protocol::role_metadata(role).uuid(),
            CharPropFlags::READ | CharPropFlags::NOTIFY,
        )
    }

    fn catalog(roles: &[RoleId]) -> Vec<GattService> {
        vec![GattService::new(
            protocol::BLUNO_SERVICE_UUID,
            roles.iter().copied().map(characteristic).collect(),
        )]
    }

    #[test]
    fn all_three_roles_make_a_compatible_device() {
        let bindings = RoleBindings::resolve(&catalog(&[
            RoleId::Identity,
            RoleId::Serial,
            RoleId::Command,
        ]));

        assert!(bindings.is_compatible());
        assert_matches!(bindings.ensure_compatible(), Ok(()));
    }

    #[rstest]
    #[case::no_identity(&[RoleId::Serial, RoleId::Command], RoleId::Identity)]
    #[case::no_serial(&[RoleId::Identity, RoleId::Command], RoleId::Serial)]
    #[case::no_command(&[RoleId::Identity, RoleId::Serial], RoleId::Command)]
    fn any_missing_role_is_incompatible(#[case] present: &[RoleId], #[case] missing: RoleId) {
        let bindings = RoleBindings::resolve(&catalog(present));

        assert!(!bindings.is_compatible());
        assert_eq!(vec![missing], bindings.missing_roles());
        assert_matches!(
            bindings.ensure_compatible(),
            Err(InteractionError::IncompatibleDevice { missing: roles }) if roles == vec![missing]
        );
    }

    #[test]
    fn unrelated_characteristics_are_ignored() {
        let services = vec![GattService::new(
            "00001800-0000-1000-8000-00805f9b34fb",
            vec![GattCharacteristic::new(
                "00001800-0000-1000-8000-00805f9b34fb",
                "00002a00-0000-1000-8000-00805f9b34fb",
                CharPropFlags::READ,
            )],
        )];

        assert_eq!(RoleBindings::default(), RoleBindings::resolve(&services));
    }

    #[test]
    fn role_of_matches_bound_uuid_case_insensitively() {
        let bindings = RoleBindings::resolve(&catalog(&[RoleId::Serial]));

        assert_eq!(
            Some(RoleId::Serial),
            bindings.role_of("0000DFB1-0000-1000-8000-00805F9B34FB")
        );
        assert_eq!(None, bindings.role_of(protocol::role_metadata(RoleId::Command).uuid()));
    }
}

//! Which operations a front end should offer for a session snapshot.
//!
//! Pure function of [`SessionSnapshot`]; it sends nothing. Controllers
//! enforce the same rules again, so a stale snapshot can only hide or
//! show a button, never bypass a check.

use std::collections::BTreeSet;

use keyward_proto::PinRole;
use serde::Serialize;

use crate::auth::AuthState;
use crate::session::{LinkState, SessionSnapshot};
use crate::state::{DeviceStatus, HiddenVolumeState, SafeStatus, VolumeState};

/// Operation a caller may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    Connect,
    Authenticate(PinRole),
    ChangeCredential(PinRole),
    LockDevice,
    FactoryReset,
    ResyncTime,
    EnableEncryptedVolume,
    DisableEncryptedVolume,
    SetUnencryptedVolumeMode,
    CreateHiddenVolume,
    EnableHiddenVolume,
    DisableHiddenVolume,
    RegenerateAesKeys,
    FillWithRandom,
    ClearNewSdCardWarning,
    WriteOtpSlot,
    EraseOtpSlot,
    GenerateOtp,
    UnlockPasswordSafe,
    LockPasswordSafe,
    ReadPasswordSafe,
    WritePasswordSafe,
    EnterUpdateMode,
    LockFirmware,
    ExportFirmware,
}

/// Operations that are currently legal.
#[must_use]
pub fn legal_operations(snapshot: &SessionSnapshot) -> BTreeSet<Operation> {
    let mut ops = BTreeSet::new();
    match (snapshot.link, &snapshot.device) {
        (LinkState::Disconnected | LinkState::Terminal(_), _) => {
            ops.insert(Operation::Connect);
        }
        (LinkState::Connected | LinkState::CommandInFlight, Some(device)) => {
            device_operations(device, &mut ops);
        }
        (LinkState::Connecting, _) | (_, None) => {}
    }
    ops
}

fn device_operations(device: &DeviceStatus, ops: &mut BTreeSet<Operation>) {
    let usable = |role| device.auth_state(role) != AuthState::PermanentlyLockedOut;
    let admin = device.auth_state(PinRole::Admin) == AuthState::Authenticated;
    let user = device.auth_state(PinRole::User) == AuthState::Authenticated;
    let storage = device.model.has_storage();

    ops.insert(Operation::LockDevice);
    ops.insert(Operation::ResyncTime);
    for role in [PinRole::User, PinRole::Admin] {
        if usable(role) {
            ops.insert(Operation::Authenticate(role));
            ops.insert(Operation::ChangeCredential(role));
        }
    }
    if usable(PinRole::Admin) {
        ops.insert(Operation::FactoryReset);
    }

    if admin {
        ops.insert(Operation::WriteOtpSlot);
        ops.insert(Operation::EraseOtpSlot);
        ops.insert(Operation::RegenerateAesKeys);
    }
    if device.otp_slots.iter().any(|s| s.programmed) && (!device.otp_user_pin_protected || user) {
        ops.insert(Operation::GenerateOtp);
    }

    match device.safe {
        SafeStatus::Unlocked => {
            ops.insert(Operation::LockPasswordSafe);
            ops.insert(Operation::ReadPasswordSafe);
            ops.insert(Operation::WritePasswordSafe);
        }
        SafeStatus::Locked | SafeStatus::Invalidated => {
            if device.aes_initialized && usable(PinRole::User) {
                ops.insert(Operation::UnlockPasswordSafe);
            }
        }
    }

    if !storage {
        return;
    }
    ops.insert(Operation::SetUnencryptedVolumeMode);
    if usable(PinRole::Firmware) {
        ops.insert(Operation::ChangeCredential(PinRole::Firmware));
    }
    match device.encrypted_volume {
        VolumeState::Disabled => {
            if usable(PinRole::User) {
                ops.insert(Operation::EnableEncryptedVolume);
            }
        }
        VolumeState::Enabled => {
            ops.insert(Operation::DisableEncryptedVolume);
            ops.insert(Operation::EnableHiddenVolume);
            if device.filled_with_random {
                ops.insert(Operation::CreateHiddenVolume);
            }
        }
    }
    if device
        .hidden_volumes
        .iter()
        .any(|h| h.state == HiddenVolumeState::Enabled)
    {
        ops.insert(Operation::DisableHiddenVolume);
    }
    if admin {
        ops.insert(Operation::FillWithRandom);
        ops.insert(Operation::ExportFirmware);
        if device.new_sd_card {
            ops.insert(Operation::ClearNewSdCardWarning);
        }
        if !device.firmware_locked {
            ops.insert(Operation::LockFirmware);
        }
    }
    if !device.firmware_locked && usable(PinRole::Firmware) {
        ops.insert(Operation::EnterUpdateMode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{HiddenVolume, RoleStatus, TimeSync};
    use keyward_proto::{
        DeviceLimits, DeviceModel, FirmwareVersion, OtpDigits, OtpSlotId, OtpSlotInfo,
        UnencryptedMode,
    };

    fn device(model: DeviceModel) -> DeviceStatus {
        let firmware = FirmwareVersion::new(0, 53);
        DeviceStatus {
            session_id: 1,
            model,
            firmware,
            serial: "0001".into(),
            storage_capacity_gb: 16,
            limits: DeviceLimits::for_device(model, firmware, true),
            auth: PinRole::ALL.map(|role| RoleStatus {
                role,
                state: AuthState::Locked,
                retries: 3,
            }),
            time: TimeSync::in_sync(),
            aes_initialized: true,
            otp_user_pin_protected: false,
            firmware_locked: false,
            new_sd_card: false,
            filled_with_random: true,
            unencrypted_mode: UnencryptedMode::ReadWrite,
            encrypted_volume: VolumeState::Disabled,
            hidden_volumes: [HiddenVolume {
                state: HiddenVolumeState::NotConfigured,
                range: None,
            }; 4],
            safe: SafeStatus::Locked,
            otp_slots: vec![OtpSlotInfo {
                slot: OtpSlotId::totp(0),
                programmed: true,
                name: "mail".into(),
                digits: OtpDigits::Six,
                interval_secs: 30,
            }],
        }
    }

    fn connected(device: DeviceStatus) -> SessionSnapshot {
        SessionSnapshot {
            link: LinkState::Connected,
            device: Some(device),
        }
    }

    #[test]
    fn disconnected_only_connects() {
        let snap = SessionSnapshot {
            link: LinkState::Disconnected,
            device: None,
        };
        assert_eq!(
            legal_operations(&snap).into_iter().collect::<Vec<_>>(),
            vec![Operation::Connect]
        );
    }

    #[test]
    fn pro_has_no_volume_operations() {
        let ops = legal_operations(&connected(device(DeviceModel::Pro)));
        assert!(ops.contains(&Operation::UnlockPasswordSafe));
        assert!(!ops.contains(&Operation::EnableEncryptedVolume));
        assert!(!ops.contains(&Operation::EnterUpdateMode));
    }

    #[test]
    fn admin_operations_need_admin() {
        let mut dev = device(DeviceModel::Storage);
        assert!(!legal_operations(&connected(dev.clone())).contains(&Operation::WriteOtpSlot));
        dev.auth[PinRole::Admin.index()].state = AuthState::Authenticated;
        let ops = legal_operations(&connected(dev));
        assert!(ops.contains(&Operation::WriteOtpSlot));
        assert!(ops.contains(&Operation::RegenerateAesKeys));
        assert!(ops.contains(&Operation::LockFirmware));
    }

    #[test]
    fn locked_out_user_cannot_unlock() {
        let mut dev = device(DeviceModel::Storage);
        dev.auth[PinRole::User.index()] = RoleStatus {
            role: PinRole::User,
            state: AuthState::PermanentlyLockedOut,
            retries: 0,
        };
        let ops = legal_operations(&connected(dev));
        assert!(!ops.contains(&Operation::Authenticate(PinRole::User)));
        assert!(!ops.contains(&Operation::EnableEncryptedVolume));
        assert!(!ops.contains(&Operation::UnlockPasswordSafe));
    }

    #[test]
    fn hidden_volumes_need_encrypted_volume() {
        let mut dev = device(DeviceModel::Storage);
        assert!(!legal_operations(&connected(dev.clone())).contains(&Operation::CreateHiddenVolume));
        dev.encrypted_volume = VolumeState::Enabled;
        assert!(legal_operations(&connected(dev)).contains(&Operation::CreateHiddenVolume));
    }

    #[test]
    fn hidden_volumes_need_random_fill() {
        let mut dev = device(DeviceModel::Storage);
        dev.encrypted_volume = VolumeState::Enabled;
        dev.filled_with_random = false;
        let ops = legal_operations(&connected(dev));
        assert!(!ops.contains(&Operation::CreateHiddenVolume));
        assert!(ops.contains(&Operation::EnableHiddenVolume));
    }

    #[test]
    fn protected_otp_needs_user() {
        let mut dev = device(DeviceModel::Pro);
        dev.otp_user_pin_protected = true;
        assert!(!legal_operations(&connected(dev.clone())).contains(&Operation::GenerateOtp));
        dev.auth[PinRole::User.index()].state = AuthState::Authenticated;
        assert!(legal_operations(&connected(dev)).contains(&Operation::GenerateOtp));
    }
}

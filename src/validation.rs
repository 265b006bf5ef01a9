// backuptool/src/validation.rs
//! Pure eligibility predicates consumed by the backup and restore
//! workflows. The first failing check is the reported reason.

use crate::cluster::BlockedReason;

/// Inputs for the backup eligibility decision, captured from a single
/// role snapshot.
#[derive(Debug, Clone, Copy)]
pub struct BackupEligibility {
    pub is_blocked: bool,
    pub is_primary: bool,
    pub planned_units: u32,
    pub tls_enabled: bool,
    pub member_started: bool,
    pub stanza_registered: bool,
}

/// Validates whether this unit can perform a backup.
pub fn can_unit_perform_backup(eligibility: &BackupEligibility) -> Result<(), String> {
    if eligibility.is_blocked {
        return Err("unit is in a blocking state".to_string());
    }
    // The primary must not carry backup load when replicas can take it,
    // which they can only do over TLS.
    if eligibility.is_primary && eligibility.planned_units > 1 && eligibility.tls_enabled {
        return Err("unit cannot perform backups as it is the cluster primary".to_string());
    }
    // Without TLS a replica cannot ask the primary to push missing WAL
    // files to the repository before the backup starts.
    if !eligibility.is_primary && !eligibility.tls_enabled {
        return Err("unit cannot perform backups as TLS is not enabled".to_string());
    }
    if !eligibility.member_started {
        return Err("unit cannot perform backups as it's not in running state".to_string());
    }
    if !eligibility.stanza_registered {
        return Err("stanza was not initialised".to_string());
    }
    Ok(())
}

/// Inputs for the restore eligibility decision.
#[derive(Debug, Clone, Copy)]
pub struct RestoreEligibility {
    pub backup_id_provided: bool,
    pub blocked_reason: Option<BlockedReason>,
    pub planned_units: u32,
    pub is_leader: bool,
}

/// Validates whether this unit can run a restore.
pub fn can_unit_perform_restore(eligibility: &RestoreEligibility) -> Result<(), String> {
    if !eligibility.backup_id_provided {
        return Err("missing backup-id to restore".to_string());
    }
    // Restoring is the normal remedy for a foreign-repository condition,
    // so that specific block does not stop a restore.
    match eligibility.blocked_reason {
        None | Some(BlockedReason::AnotherClusterRepository) => {}
        Some(_) => return Err("cluster or unit is in a blocking state".to_string()),
    }
    // A restore redefines the cluster identity and cannot be done safely
    // with followers attached.
    if eligibility.planned_units > 1 {
        return Err(
            "unit cannot restore backup as there are more than one unit in the cluster"
                .to_string(),
        );
    }
    if !eligibility.is_leader {
        return Err(
            "unit cannot restore backup as it was not elected the leader unit yet".to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed_backup() -> BackupEligibility {
        BackupEligibility {
            is_blocked: false,
            is_primary: true,
            planned_units: 1,
            tls_enabled: false,
            member_started: true,
            stanza_registered: true,
        }
    }

    #[test]
    fn test_primary_with_replicas_and_tls_is_denied() {
        let eligibility = BackupEligibility {
            is_primary: true,
            planned_units: 2,
            tls_enabled: true,
            ..allowed_backup()
        };
        let reason = can_unit_perform_backup(&eligibility).unwrap_err();
        assert_eq!(
            reason,
            "unit cannot perform backups as it is the cluster primary"
        );
    }

    #[test]
    fn test_replica_without_tls_is_denied() {
        let eligibility = BackupEligibility {
            is_primary: false,
            tls_enabled: false,
            ..allowed_backup()
        };
        let reason = can_unit_perform_backup(&eligibility).unwrap_err();
        assert_eq!(reason, "unit cannot perform backups as TLS is not enabled");
    }

    #[test]
    fn test_single_primary_without_tls_is_allowed() {
        assert!(can_unit_perform_backup(&allowed_backup()).is_ok());
    }

    #[test]
    fn test_replica_with_tls_is_allowed() {
        let eligibility = BackupEligibility {
            is_primary: false,
            planned_units: 3,
            tls_enabled: true,
            ..allowed_backup()
        };
        assert!(can_unit_perform_backup(&eligibility).is_ok());
    }

    #[test]
    fn test_blocked_unit_cannot_back_up() {
        let eligibility = BackupEligibility {
            is_blocked: true,
            ..allowed_backup()
        };
        assert_eq!(
            can_unit_perform_backup(&eligibility).unwrap_err(),
            "unit is in a blocking state"
        );
    }

    #[test]
    fn test_unregistered_stanza_blocks_backup() {
        let eligibility = BackupEligibility {
            stanza_registered: false,
            ..allowed_backup()
        };
        assert_eq!(
            can_unit_perform_backup(&eligibility).unwrap_err(),
            "stanza was not initialised"
        );
    }

    fn allowed_restore() -> RestoreEligibility {
        RestoreEligibility {
            backup_id_provided: true,
            blocked_reason: None,
            planned_units: 1,
            is_leader: true,
        }
    }

    #[test]
    fn test_restore_requires_backup_id() {
        let eligibility = RestoreEligibility {
            backup_id_provided: false,
            ..allowed_restore()
        };
        assert_eq!(
            can_unit_perform_restore(&eligibility).unwrap_err(),
            "missing backup-id to restore"
        );
    }

    #[test]
    fn test_restore_allowed_despite_foreign_repository_block() {
        let eligibility = RestoreEligibility {
            blocked_reason: Some(BlockedReason::AnotherClusterRepository),
            ..allowed_restore()
        };
        assert!(can_unit_perform_restore(&eligibility).is_ok());
    }

    #[test]
    fn test_restore_denied_for_other_blocks() {
        let eligibility = RestoreEligibility {
            blocked_reason: Some(BlockedReason::FailedToInitializeStanza),
            ..allowed_restore()
        };
        assert_eq!(
            can_unit_perform_restore(&eligibility).unwrap_err(),
            "cluster or unit is in a blocking state"
        );
    }

    #[test]
    fn test_restore_denied_with_multiple_units() {
        let eligibility = RestoreEligibility {
            planned_units: 2,
            ..allowed_restore()
        };
        assert!(can_unit_perform_restore(&eligibility).is_err());
    }

    #[test]
    fn test_restore_denied_for_non_leader() {
        let eligibility = RestoreEligibility {
            is_leader: false,
            ..allowed_restore()
        };
        assert!(can_unit_perform_restore(&eligibility).is_err());
    }
}

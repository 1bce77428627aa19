//! Business entity descriptors and domain enums
//!
//! Declares the eleven entities of the practice-management schema: roles,
//! permissions, users, clients, subjects, properties, service types,
//! services, payments, and the two many-to-many join entities
//! (role_permission, service_payment).

use super::{
    DefaultValue, EntityDef, FieldDef, RelationDef, RelationKind, ScalarType, SchemaRegistry,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Action a permission grants on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionAction {
    Create,
    Read,
    Update,
    Delete,
    Manage,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Create => "CREATE",
            PermissionAction::Read => "READ",
            PermissionAction::Update => "UPDATE",
            PermissionAction::Delete => "DELETE",
            PermissionAction::Manage => "MANAGE",
        }
    }
}

impl fmt::Display for PermissionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(PermissionAction::Create),
            "READ" => Ok(PermissionAction::Read),
            "UPDATE" => Ok(PermissionAction::Update),
            "DELETE" => Ok(PermissionAction::Delete),
            "MANAGE" => Ok(PermissionAction::Manage),
            other => Err(format!("unknown permission action: {}", other)),
        }
    }
}

/// Resource a permission applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionResource {
    User,
    Role,
    Client,
    Subject,
    Property,
    Service,
    ServiceType,
    Payment,
    Report,
}

impl PermissionResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionResource::User => "USER",
            PermissionResource::Role => "ROLE",
            PermissionResource::Client => "CLIENT",
            PermissionResource::Subject => "SUBJECT",
            PermissionResource::Property => "PROPERTY",
            PermissionResource::Service => "SERVICE",
            PermissionResource::ServiceType => "SERVICE_TYPE",
            PermissionResource::Payment => "PAYMENT",
            PermissionResource::Report => "REPORT",
        }
    }
}

impl fmt::Display for PermissionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Completed => "COMPLETED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a payment was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    BankTransfer,
    Card,
    Check,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::BankTransfer => "BANK_TRANSFER",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Check => "CHECK",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn id_field() -> FieldDef {
    FieldDef::required("id", ScalarType::Uuid).with_default(DefaultValue::UuidV4)
}

fn timestamps() -> [FieldDef; 2] {
    [
        FieldDef::required("created_at", ScalarType::DateTime).with_default(DefaultValue::Now),
        FieldDef::required("updated_at", ScalarType::DateTime).with_default(DefaultValue::Now),
    ]
}

fn build_registry() -> SchemaRegistry {
    let [created_at, updated_at] = timestamps();

    let role = EntityDef {
        name: "role",
        table: "roles",
        fields: vec![
            id_field(),
            FieldDef::required("name", ScalarType::Text),
            FieldDef::optional("description", ScalarType::Text),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["name"]],
        relations: vec![
            RelationDef {
                name: "users",
                target: "user",
                kind: RelationKind::HasMany {
                    foreign_key: "role_id",
                },
            },
            RelationDef {
                name: "permissions",
                target: "permission",
                kind: RelationKind::ManyToMany {
                    join_entity: "role_permission",
                    near_key: "role_id",
                    far_relation: "permission",
                },
            },
        ],
    };

    let permission = EntityDef {
        name: "permission",
        table: "permissions",
        fields: vec![
            id_field(),
            FieldDef::required("action", ScalarType::Text),
            FieldDef::required("resource", ScalarType::Text),
            FieldDef::optional("description", ScalarType::Text),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["action", "resource"]],
        relations: vec![RelationDef {
            name: "roles",
            target: "role",
            kind: RelationKind::ManyToMany {
                join_entity: "role_permission",
                near_key: "permission_id",
                far_relation: "role",
            },
        }],
    };

    let role_permission = EntityDef {
        name: "role_permission",
        table: "role_permissions",
        fields: vec![
            FieldDef::required("role_id", ScalarType::Uuid),
            FieldDef::required("permission_id", ScalarType::Uuid),
            FieldDef::required("assigned_at", ScalarType::DateTime)
                .with_default(DefaultValue::Now),
        ],
        primary_key: vec!["role_id", "permission_id"],
        uniques: vec![],
        relations: vec![
            RelationDef {
                name: "role",
                target: "role",
                kind: RelationKind::BelongsTo {
                    foreign_key: "role_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "permission",
                target: "permission",
                kind: RelationKind::BelongsTo {
                    foreign_key: "permission_id",
                    nullable: false,
                },
            },
        ],
    };

    let user = EntityDef {
        name: "user",
        table: "users",
        fields: vec![
            id_field(),
            FieldDef::required("name", ScalarType::Text),
            FieldDef::required("email", ScalarType::Text),
            FieldDef::required("password", ScalarType::Text),
            FieldDef::required("is_active", ScalarType::Bool)
                .with_default(DefaultValue::Bool(true)),
            FieldDef::required("role_id", ScalarType::Uuid),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["email"]],
        relations: vec![
            RelationDef {
                name: "role",
                target: "role",
                kind: RelationKind::BelongsTo {
                    foreign_key: "role_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "services",
                target: "service",
                kind: RelationKind::HasMany {
                    foreign_key: "user_id",
                },
            },
        ],
    };

    let client = EntityDef {
        name: "client",
        table: "clients",
        fields: vec![
            id_field(),
            FieldDef::required("tax_id", ScalarType::Text),
            FieldDef::optional("vat_number", ScalarType::Text),
            FieldDef::required("first_name", ScalarType::Text),
            FieldDef::required("last_name", ScalarType::Text),
            FieldDef::required("email", ScalarType::Text),
            FieldDef::optional("phone", ScalarType::Text),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["tax_id"], vec!["vat_number"], vec!["email"]],
        relations: vec![
            RelationDef {
                name: "subjects",
                target: "subject",
                kind: RelationKind::HasMany {
                    foreign_key: "client_id",
                },
            },
            RelationDef {
                name: "properties",
                target: "property",
                kind: RelationKind::HasMany {
                    foreign_key: "client_id",
                },
            },
            RelationDef {
                name: "services",
                target: "service",
                kind: RelationKind::HasMany {
                    foreign_key: "client_id",
                },
            },
        ],
    };

    let subject = EntityDef {
        name: "subject",
        table: "subjects",
        fields: vec![
            id_field(),
            FieldDef::required("tax_id", ScalarType::Text),
            FieldDef::required("first_name", ScalarType::Text),
            FieldDef::required("last_name", ScalarType::Text),
            FieldDef::required("client_id", ScalarType::Uuid),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["tax_id"]],
        relations: vec![RelationDef {
            name: "client",
            target: "client",
            kind: RelationKind::BelongsTo {
                foreign_key: "client_id",
                nullable: false,
            },
        }],
    };

    let property = EntityDef {
        name: "property",
        table: "properties",
        fields: vec![
            id_field(),
            FieldDef::required("cadastral_code", ScalarType::Text),
            FieldDef::required("address", ScalarType::Text),
            FieldDef::required("city", ScalarType::Text),
            FieldDef::required("client_id", ScalarType::Uuid),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["cadastral_code"]],
        relations: vec![
            RelationDef {
                name: "client",
                target: "client",
                kind: RelationKind::BelongsTo {
                    foreign_key: "client_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "services",
                target: "service",
                kind: RelationKind::HasMany {
                    foreign_key: "property_id",
                },
            },
        ],
    };

    let service_type = EntityDef {
        name: "service_type",
        table: "service_types",
        fields: vec![
            id_field(),
            FieldDef::required("name", ScalarType::Text),
            FieldDef::optional("description", ScalarType::Text),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![vec!["name"]],
        relations: vec![RelationDef {
            name: "services",
            target: "service",
            kind: RelationKind::HasMany {
                foreign_key: "service_type_id",
            },
        }],
    };

    // client and service_type are required, property and user optional.
    // The asymmetry mirrors the schema and is intentional.
    let service = EntityDef {
        name: "service",
        table: "services",
        fields: vec![
            id_field(),
            FieldDef::required("description", ScalarType::Text),
            FieldDef::required("date", ScalarType::DateTime),
            FieldDef::required("amount", ScalarType::Float),
            FieldDef::optional("payment_status", ScalarType::Text),
            FieldDef::required("client_id", ScalarType::Uuid),
            FieldDef::optional("property_id", ScalarType::Uuid),
            FieldDef::required("service_type_id", ScalarType::Uuid),
            FieldDef::optional("user_id", ScalarType::Uuid),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![],
        relations: vec![
            RelationDef {
                name: "client",
                target: "client",
                kind: RelationKind::BelongsTo {
                    foreign_key: "client_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "property",
                target: "property",
                kind: RelationKind::BelongsTo {
                    foreign_key: "property_id",
                    nullable: true,
                },
            },
            RelationDef {
                name: "service_type",
                target: "service_type",
                kind: RelationKind::BelongsTo {
                    foreign_key: "service_type_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "user",
                target: "user",
                kind: RelationKind::BelongsTo {
                    foreign_key: "user_id",
                    nullable: true,
                },
            },
            RelationDef {
                name: "payments",
                target: "payment",
                kind: RelationKind::ManyToMany {
                    join_entity: "service_payment",
                    near_key: "service_id",
                    far_relation: "payment",
                },
            },
        ],
    };

    let payment = EntityDef {
        name: "payment",
        table: "payments",
        fields: vec![
            id_field(),
            FieldDef::required("date", ScalarType::DateTime),
            FieldDef::required("amount", ScalarType::Float),
            FieldDef::required("is_refund", ScalarType::Bool)
                .with_default(DefaultValue::Bool(false)),
            FieldDef::required("status", ScalarType::Text),
            FieldDef::required("method", ScalarType::Text),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["id"],
        uniques: vec![],
        relations: vec![RelationDef {
            name: "services",
            target: "service",
            kind: RelationKind::ManyToMany {
                join_entity: "service_payment",
                near_key: "payment_id",
                far_relation: "service",
            },
        }],
    };

    let service_payment = EntityDef {
        name: "service_payment",
        table: "service_payments",
        fields: vec![
            FieldDef::required("service_id", ScalarType::Uuid),
            FieldDef::required("payment_id", ScalarType::Uuid),
            created_at.clone(),
            updated_at.clone(),
        ],
        primary_key: vec!["service_id", "payment_id"],
        uniques: vec![],
        relations: vec![
            RelationDef {
                name: "service",
                target: "service",
                kind: RelationKind::BelongsTo {
                    foreign_key: "service_id",
                    nullable: false,
                },
            },
            RelationDef {
                name: "payment",
                target: "payment",
                kind: RelationKind::BelongsTo {
                    foreign_key: "payment_id",
                    nullable: false,
                },
            },
        ],
    };

    SchemaRegistry::new(vec![
        role,
        permission,
        role_permission,
        user,
        client,
        subject,
        property,
        service_type,
        service,
        payment,
        service_payment,
    ])
}

/// The global schema registry
pub fn registry() -> &'static SchemaRegistry {
    static REGISTRY: OnceLock<SchemaRegistry> = OnceLock::new();
    REGISTRY.get_or_init(build_registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip() {
        assert_eq!(PermissionAction::Delete.as_str(), "DELETE");
        assert_eq!(
            "DELETE".parse::<PermissionAction>().unwrap(),
            PermissionAction::Delete
        );
        assert!("delete".parse::<PermissionAction>().is_err());
        assert_eq!(PaymentMethod::BankTransfer.to_string(), "BANK_TRANSFER");
    }

    #[test]
    fn test_defaults_declared() {
        let user = registry().entity("user").unwrap();
        let is_active = user.field("is_active").unwrap();
        assert_eq!(is_active.default, Some(DefaultValue::Bool(true)));

        let payment = registry().entity("payment").unwrap();
        let is_refund = payment.field("is_refund").unwrap();
        assert_eq!(is_refund.default, Some(DefaultValue::Bool(false)));
    }

    #[test]
    fn test_join_entities_have_no_surrogate_id() {
        let sp = registry().entity("service_payment").unwrap();
        assert!(sp.field("id").is_none());
        assert_eq!(sp.primary_key.len(), 2);
    }
}

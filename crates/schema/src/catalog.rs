//! Built-in kinds for the Railway control plane.

#![forbid(unsafe_code)]

use crate::{
    Catalog, CreateSemantics, DeletionStrategy, FieldPolicyTable, IdentityScheme, KindSchema, SchemaError, Validator,
};

pub const PRIVATE_NETWORK: &str = "private_network";
pub const PRIVATE_NETWORK_ENDPOINT: &str = "private_network_endpoint";
pub const SERVICE_INSTANCE: &str = "service_instance";
pub const SERVICE_LIMITS: &str = "service_limits";
pub const PROJECT: &str = "project";
pub const SERVICE: &str = "service";
pub const ENVIRONMENT: &str = "environment";

fn service_env_identity() -> IdentityScheme {
    IdentityScheme::Composite { attributes: vec!["service_id".into(), "environment_id".into()] }
}

/// Private network. Created with create-or-get; never updated; the remote only
/// deletes all networks of an environment at once.
pub fn private_network() -> Result<KindSchema, SchemaError> {
    let policy = FieldPolicyTable::builder(PRIVATE_NETWORK)
        .server_authoritative("id")
        .immutable("name")
        .immutable("project_id")
        .immutable("environment_id")
        .server_authoritative("dns_name")
        .mutable("tags")
        .build()?;
    KindSchema::builder(policy, IdentityScheme::Generated { attribute: "id".into() })
        .natural_key(&["project_id", "environment_id", "name"])
        .create(CreateSemantics::RemoteDeduplicates)
        .deletion(DeletionStrategy::Coarse { parent_attribute: "environment_id".into() })
        .required(&["name", "project_id", "environment_id"])
        .validate("name", Validator::MinLength(1))
        .validate("project_id", Validator::MinLength(1))
        .validate("environment_id", Validator::MinLength(1))
        .build(PRIVATE_NETWORK)
}

/// Service attachment to a private network.
pub fn private_network_endpoint() -> Result<KindSchema, SchemaError> {
    let policy = FieldPolicyTable::builder(PRIVATE_NETWORK_ENDPOINT)
        .server_authoritative("id")
        .immutable("private_network_id")
        .immutable("service_id")
        .immutable("environment_id")
        .immutable("service_name")
        .server_authoritative("dns_name")
        .server_authoritative("private_ips")
        .mutable("tags")
        .build()?;
    KindSchema::builder(policy, IdentityScheme::Generated { attribute: "id".into() })
        .natural_key(&["private_network_id", "service_id", "environment_id"])
        .create(CreateSemantics::RemoteDeduplicates)
        .deletion(DeletionStrategy::Scoped)
        .required(&["private_network_id", "service_id", "environment_id", "service_name"])
        .validate("private_network_id", Validator::MinLength(1))
        .validate("service_id", Validator::Uuid)
        .validate("environment_id", Validator::Uuid)
        .validate("service_name", Validator::MinLength(1))
        .build(PRIVATE_NETWORK_ENDPOINT)
}

/// Environment-scoped configuration of a service. Exists as long as the service
/// does, so "create" is an update of the existing instance and delete is a no-op.
pub fn service_instance() -> Result<KindSchema, SchemaError> {
    let policy = FieldPolicyTable::builder(SERVICE_INSTANCE)
        .immutable("service_id")
        .immutable("environment_id")
        .mutable("source_image")
        .mutable("source_repo")
        .write_only("registry_credentials_username")
        .write_only("registry_credentials_password")
        .write_only("redeploy")
        .mutable("builder")
        .mutable("build_command")
        .mutable("start_command")
        // Remote reports this in an inconsistent JSON shape; local value wins.
        .write_only("pre_deploy_command")
        .mutable("healthcheck_path")
        .mutable("healthcheck_timeout")
        .mutable("restart_policy_type")
        .mutable("restart_policy_max_retries")
        .mutable("sleep_application")
        .build()?;
    KindSchema::builder(policy, service_env_identity())
        .natural_key(&["service_id", "environment_id"])
        .create(CreateSemantics::RemoteDeduplicates)
        .updatable()
        .deletion(DeletionStrategy::Unsupported)
        // Redeploy after every change unless turned off.
        .action("redeploy", "redeploy", true)
        .required(&["service_id", "environment_id"])
        .validate("service_id", Validator::Uuid)
        .validate("environment_id", Validator::Uuid)
        .validate("source_image", Validator::MinLength(1))
        .validate("source_image", Validator::ConflictsWith("source_repo".into()))
        .validate("source_repo", Validator::MinLength(1))
        .validate("source_repo", Validator::ConflictsWith("source_image".into()))
        .validate("registry_credentials_username", Validator::MinLength(1))
        .validate("registry_credentials_username", Validator::AlsoRequires("registry_credentials_password".into()))
        .validate("registry_credentials_password", Validator::MinLength(1))
        .validate("registry_credentials_password", Validator::AlsoRequires("registry_credentials_username".into()))
        .validate("builder", Validator::OneOf(vec!["NIXPACKS".into(), "HEROKU".into(), "PAKETO".into(), "RAILPACK".into()]))
        .validate("healthcheck_timeout", Validator::AtLeast(1.0))
        .validate("restart_policy_type", Validator::OneOf(vec!["ALWAYS".into(), "NEVER".into(), "ON_FAILURE".into()]))
        .validate("restart_policy_max_retries", Validator::AtLeast(0.0))
        .build(SERVICE_INSTANCE)
}

/// CPU/memory limits of a service instance. The remote accepts them but never reports them back.
pub fn service_limits() -> Result<KindSchema, SchemaError> {
    let policy = FieldPolicyTable::builder(SERVICE_LIMITS)
        .immutable("service_id")
        .immutable("environment_id")
        .write_only("memory_gb")
        .write_only("vcpus")
        .build()?;
    KindSchema::builder(policy, service_env_identity())
        .natural_key(&["service_id", "environment_id"])
        .create(CreateSemantics::RemoteDeduplicates)
        .updatable()
        .deletion(DeletionStrategy::Unsupported)
        .required(&["service_id", "environment_id"])
        .validate("service_id", Validator::Uuid)
        .validate("environment_id", Validator::Uuid)
        .validate("memory_gb", Validator::AtLeast(0.25))
        .validate("vcpus", Validator::AtLeast(0.25))
        .build(SERVICE_LIMITS)
}

fn lookup_kind(name: &str, attrs: &[&str]) -> Result<KindSchema, SchemaError> {
    let mut policy = FieldPolicyTable::builder(name).server_authoritative("id");
    for a in attrs {
        policy = policy.server_authoritative(a);
    }
    KindSchema::builder(policy.build()?, IdentityScheme::Generated { attribute: "id".into() })
        .read_only()
        .validate("id", Validator::Uuid)
        .build(name)
}

/// Project lookup. `default_environment_id` is the oldest environment.
pub fn project() -> Result<KindSchema, SchemaError> {
    lookup_kind(PROJECT, &["name", "description", "is_public", "has_pr_deploys", "workspace_id", "default_environment_id"])
}

pub fn service() -> Result<KindSchema, SchemaError> { lookup_kind(SERVICE, &["name", "project_id"]) }

pub fn environment() -> Result<KindSchema, SchemaError> { lookup_kind(ENVIRONMENT, &["name", "project_id"]) }

/// Catalog with every built-in kind registered.
pub fn railway() -> Result<Catalog, SchemaError> {
    let mut c = Catalog::new();
    c.register(private_network()?);
    c.register(private_network_endpoint()?);
    c.register(service_instance()?);
    c.register(service_limits()?);
    c.register(project()?);
    c.register(service()?);
    c.register(environment()?);
    Ok(c)
}

//! The parameter evaluation context.
//!
//! A context is owned by exactly one evaluation pass. It is seeded with the
//! reserved system parameters, accumulates resolved values as evaluation
//! proceeds, and hosts the helper functions expressions may call.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::ast::{Expr, HelperFn, Value};
use crate::cidr;
use crate::domain::{OfferName, PlanName, ProvisioningType, SubscriptionId};
use crate::port::IpPool;

pub const OFFER_NAME_PARAMETER: &str = "system$$offerName";
pub const SUBSCRIPTION_OWNER_PARAMETER: &str = "system$$subscriptionOwner";
pub const SUBSCRIPTION_ID_PARAMETER: &str = "system$$subscriptionId";
pub const PLAN_NAME_PARAMETER: &str = "system$$planName";
pub const OPERATION_TYPE_PARAMETER: &str = "system$$operationType";

/// System-injected parameter names; user parameters may not redeclare
/// these, and evaluation never overwrites them.
pub const RESERVED_PARAMETER_NAMES: &[&str] = &[
    OFFER_NAME_PARAMETER,
    SUBSCRIPTION_OWNER_PARAMETER,
    SUBSCRIPTION_ID_PARAMETER,
    PLAN_NAME_PARAMETER,
    OPERATION_TYPE_PARAMETER,
];

const RANDOM_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Upper bound for `GetRandomString` lengths.
const MAX_RANDOM_STRING_LEN: i64 = 1024;

/// Accumulating name -> value map for one evaluation pass.
pub struct Context {
    parameters: BTreeMap<String, Value>,
    ip_pool: Option<Arc<dyn IpPool>>,
    rng: StdRng,
}

impl Context {
    /// Seed a fresh context with the reserved system parameters.
    pub fn new(
        offer: &OfferName,
        owner: &str,
        subscription_id: SubscriptionId,
        plan: &PlanName,
        operation: ProvisioningType,
    ) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            OFFER_NAME_PARAMETER.to_string(),
            Value::Str(offer.to_string()),
        );
        parameters.insert(
            SUBSCRIPTION_OWNER_PARAMETER.to_string(),
            Value::Str(owner.to_string()),
        );
        parameters.insert(
            SUBSCRIPTION_ID_PARAMETER.to_string(),
            Value::Str(subscription_id.to_string()),
        );
        parameters.insert(PLAN_NAME_PARAMETER.to_string(), Value::Str(plan.to_string()));
        parameters.insert(
            OPERATION_TYPE_PARAMETER.to_string(),
            Value::Str(operation.to_string()),
        );

        Self {
            parameters,
            ip_pool: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic RNG; for tests and replayable evaluation.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Attach the address pool collaborator backing `GetIpRange`.
    pub fn with_ip_pool(mut self, pool: Arc<dyn IpPool>) -> Self {
        self.ip_pool = Some(pool);
        self
    }

    /// Whether a name is one of the system-injected reserved parameters.
    pub fn is_reserved(name: &str) -> bool {
        RESERVED_PARAMETER_NAMES.contains(&name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Insert a value unless the name is already bound. Existing entries
    /// (reserved parameters in particular) are never clobbered.
    pub fn insert_if_absent(&mut self, name: &str, value: Value) -> bool {
        if self.parameters.contains_key(name) {
            return false;
        }
        self.parameters.insert(name.to_string(), value);
        true
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    /// Evaluate a parsed expression against this context.
    ///
    /// Errors are plain reason strings; the resolver wraps them with the
    /// parameter name and original expression text.
    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, String> {
        match expr {
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Param(name) => self
                .parameters
                .get(name)
                .cloned()
                .ok_or_else(|| format!("parameter \"{name}\" is not defined in the context")),
            Expr::Add(lhs, rhs) => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                match (lhs, rhs) {
                    (Value::Int(a), Value::Int(b)) => a
                        .checked_add(b)
                        .map(Value::Int)
                        .ok_or_else(|| "integer overflow in addition".to_string()),
                    (a, b) => Ok(Value::Str(format!("{a}{b}"))),
                }
            }
            Expr::Call(helper, args) => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                self.call(*helper, &values)
            }
        }
    }

    fn call(&mut self, helper: HelperFn, args: &[Value]) -> Result<Value, String> {
        match helper {
            HelperFn::GetRandomString => {
                let length = args[0]
                    .as_int()
                    .ok_or_else(|| "GetRandomString expects an integer length".to_string())?;
                if !(0..=MAX_RANDOM_STRING_LEN).contains(&length) {
                    return Err(format!(
                        "GetRandomString length must be between 0 and {MAX_RANDOM_STRING_LEN}"
                    ));
                }
                let s: String = (0..length)
                    .map(|_| {
                        let i = self.rng.gen_range(0..RANDOM_CHARS.len());
                        RANDOM_CHARS[i] as char
                    })
                    .collect();
                Ok(Value::Str(s))
            }
            HelperFn::GetSubIpRange => {
                let range = match &args[0] {
                    Value::Str(s) => s.clone(),
                    Value::Int(_) => {
                        return Err("GetSubIpRange expects (string, int, int)".to_string())
                    }
                };
                let start = args[1]
                    .as_int()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| "GetSubIpRange expects a non-negative start offset".to_string())?;
                let length = args[2]
                    .as_int()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| "GetSubIpRange expects a non-negative length".to_string())?;
                cidr::subdivide(&range, start as u64, length as u64)
                    .map(Value::Str)
                    .map_err(|e| e.to_string())
            }
            HelperFn::GetIpRange => {
                let pool = self
                    .ip_pool
                    .clone()
                    .ok_or_else(|| "no address pool is configured for GetIpRange".to_string())?;
                let offer = OfferName::from(args[0].to_string());
                let subscription = SubscriptionId::parse(&args[1].to_string()).ok_or_else(|| {
                    format!("GetIpRange subscription id '{}' is not a GUID", args[1])
                })?;
                let config_name = args[2].to_string();
                pool.assign_range(subscription, &offer, &config_name)
                    .map(Value::Str)
                    .map_err(|e| e.to_string())
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("parameters", &self.parameters)
            .field("has_ip_pool", &self.ip_pool.is_some())
            .finish()
    }
}

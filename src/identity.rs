use std::fmt::{self, Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::panic::Location;

use serde::Serialize;
use siphasher::sip128::{Hasher128, SipHasher13};

use crate::error::OnceError;

/// What kind of member an identity refers to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemberKind {
    Method,
    Getter,
    Setter,
}

/// The identity of one memoized call: a member of a wrapped type plus the
/// canonical encoding of its argument values.
///
/// Two identities are equal iff they refer to the same member and their
/// arguments are structurally equal. The construction site is captured for
/// failure summaries but takes no part in equality.
#[derive(Clone)]
pub struct Identity {
    declaring_type: &'static str,
    name: &'static str,
    kind: MemberKind,
    args: String,
    location: &'static Location<'static>,
}

impl Identity {
    /// The identity of a method call.
    ///
    /// Arguments are encoded canonically as JSON; a value that cannot be
    /// encoded is a configuration error of the wrapper, not a runtime
    /// failure of the call.
    #[track_caller]
    pub fn method<A: Serialize + ?Sized>(
        declaring_type: &'static str,
        name: &'static str,
        args: &A,
    ) -> Result<Self, OnceError> {
        let args = serde_json::to_string(args).map_err(|err| OnceError::Configuration {
            type_name: declaring_type.to_string(),
            violations: vec![format!("arguments of {name} are not serializable: {err}")],
        })?;
        Ok(Self {
            declaring_type,
            name,
            kind: MemberKind::Method,
            args,
            location: Location::caller(),
        })
    }

    /// The identity of a property read. Getters take no arguments.
    #[track_caller]
    pub fn getter(declaring_type: &'static str, name: &'static str) -> Self {
        Self {
            declaring_type,
            name,
            kind: MemberKind::Getter,
            args: "null".into(),
            location: Location::caller(),
        }
    }

    /// The identity of a property write.
    #[track_caller]
    pub fn setter(declaring_type: &'static str, name: &'static str) -> Self {
        Self {
            declaring_type,
            name,
            kind: MemberKind::Setter,
            args: "null".into(),
            location: Location::caller(),
        }
    }

    /// The identity of the paired getter: same declaring type and property
    /// name, no arguments. This is how a setter checks whether its property
    /// has already been read.
    pub fn getter_identity(&self) -> Self {
        Self {
            declaring_type: self.declaring_type,
            name: self.name,
            kind: MemberKind::Getter,
            args: "null".into(),
            location: self.location,
        }
    }

    /// The type the member belongs to.
    pub fn declaring_type(&self) -> &'static str {
        self.declaring_type
    }

    /// The member name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    /// Where the wrapper constructed this identity.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// A stable content digest of the identity, used for disk-cache file
    /// naming and summary display.
    pub fn uid(&self) -> String {
        let mut state = SipHasher13::new();
        self.hash(&mut state);
        format!("{:032x}", state.finish128().as_u128())
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.declaring_type == other.declaring_type
            && self.name == other.name
            && self.kind == other.kind
            && self.args == other.args
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.declaring_type.hash(state);
        self.name.hash(state);
        self.kind.hash(state);
        self.args.hash(state);
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl Debug for Identity {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{}::{} {:?} {}",
            self.declaring_type, self.name, self.kind, self.args
        )
    }
}

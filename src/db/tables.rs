use std::fmt::Display;

#[allow(non_camel_case_types)]
pub enum ETables {
    USERS,
    SCHEMA_MIGRATIONS,
}

impl Display for ETables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ETables {
    pub fn as_str(&self) -> &str {
        match *self {
            Self::USERS => "users",
            Self::SCHEMA_MIGRATIONS => "schema_migrations",
        }
    }
}

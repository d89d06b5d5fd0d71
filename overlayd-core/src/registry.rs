//! Generic typed TOML record store: one file per named record, used for
//! physical interfaces, tunnels, and policy groups alike.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Error)]
pub enum Error {
    #[error("record {0} not found")]
    NotFound(String),
    #[error("record {0} already exists")]
    AlreadyExists(String),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("TOML decode error: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("TOML encode error: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// A directory of `<name>.toml` files holding values of type `T`.
pub struct Registry<T> {
    dir: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Registry<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            _marker: std::marker::PhantomData,
        })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.toml"))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path_for(name).is_file()
    }

    pub fn create(&self, name: &str, value: &T) -> Result<(), Error> {
        if self.exists(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        self.save(name, value)
    }

    /// Writes unconditionally, overwriting any existing record.
    pub fn save(&self, name: &str, value: &T) -> Result<(), Error> {
        let body = toml::to_string_pretty(value)?;
        fs::write(self.path_for(name), body)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<T, Error> {
        let path = self.path_for(name);
        let body = fs::read_to_string(&path).map_err(|_| Error::NotFound(name.to_string()))?;
        Ok(toml::from_str(&body)?)
    }

    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists record names (file stem), sorted for deterministic iteration.
    pub fn list(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|e| e == "toml"))
            .filter_map(|entry| entry.path().file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn load_all(&self) -> Result<Vec<T>, Error> {
        self.list()?.iter().map(|name| self.load(name)).collect()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

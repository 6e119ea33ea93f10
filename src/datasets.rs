//! Built-in datasets for easy testing and experimentation.
#[cfg(feature = "default")]
use std::env;
#[cfg(feature = "default")]
use std::fs::{create_dir_all, rename, File};
#[cfg(feature = "default")]
use std::io::BufWriter;
#[cfg(feature = "default")]
use std::path::{Path, PathBuf};

#[cfg(feature = "default")]
use csv;
#[cfg(feature = "default")]
use failure;
#[cfg(feature = "default")]
use reqwest;

use rand::Rng;

use data::{Interaction, Interactions};

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// Can't find the home directory.
    #[fail(display = "Cannot find home directory.")]
    NoHomeDir,
}

#[cfg(feature = "default")]
fn create_data_dir() -> Result<PathBuf, failure::Error> {
    let path = env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or(DatasetError::NoHomeDir)?
        .join(".rankeval");

    if !path.exists() {
        create_dir_all(&path)?;
    }

    Ok(path)
}

#[cfg(feature = "default")]
fn download(url: &str, dest_filename: &Path) -> Result<Interactions, failure::Error> {
    let data_dir = create_data_dir()?;
    let desired_filename = data_dir.join(dest_filename);
    let temp_filename = env::temp_dir().join(dest_filename);

    if !desired_filename.exists() {
        info!("Downloading {} to {}", url, desired_filename.display());

        let file = File::create(&temp_filename)?;
        let mut writer = BufWriter::new(file);

        let mut response = reqwest::blocking::get(url)?.error_for_status()?;
        response.copy_to(&mut writer)?;
        drop(writer);

        rename(temp_filename, &desired_filename)?;
    }

    load_csv(&desired_filename)
}

/// Load interactions from a CSV file with a header naming at least the
/// `user_id` and `item_id` columns. A `weight` column is optional; other
/// columns are ignored.
#[cfg(feature = "default")]
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Interactions, failure::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let interactions: Vec<Interaction> = reader.deserialize().collect::<Result<Vec<_>, _>>()?;

    debug!("Loaded {} interactions", interactions.len());

    Ok(Interactions::from(interactions))
}

/// Download the Movielens 100K dataset and return it.
///
/// The data is stored in `~/.rankeval/`.
#[cfg(feature = "default")]
pub fn download_movielens_100k() -> Result<Interactions, failure::Error> {
    download(
        "https://github.com/maciejkula/sbr-rs/raw/master/data.csv",
        Path::new("movielens_100K.csv"),
    )
}

/// Generate clustered interactions without duplicates.
///
/// Users and items are split into `num_groups` groups by index; each user
/// draws 80% of their `interactions_per_user` items from their own group
/// and the rest from the whole catalog. Ids are `user_<n>` and `item_<n>`.
pub fn synthetic<R: Rng>(
    rng: &mut R,
    num_users: usize,
    num_items: usize,
    num_groups: usize,
    interactions_per_user: usize,
) -> Interactions {
    let num_groups = num_groups.max(1).min(num_items.max(1));
    let per_user = interactions_per_user.min(num_items);
    let mut interactions = Interactions::new();

    for user in 0..num_users {
        let group = user % num_groups;
        let in_group: Vec<usize> = (group..num_items).step_by(num_groups).collect();

        let mut chosen = vec![false; num_items];
        let mut num_chosen = 0;

        while num_chosen < per_user {
            let item = if rng.gen::<f32>() < 0.8 && !in_group.is_empty() {
                in_group[rng.gen_range(0..in_group.len())]
            } else {
                rng.gen_range(0..num_items)
            };

            if !chosen[item] {
                chosen[item] = true;
                num_chosen += 1;
                interactions.push(Interaction::new(
                    format!("user_{}", user),
                    format!("item_{}", item),
                    1.0,
                ));
            }
        }
    }

    interactions
}

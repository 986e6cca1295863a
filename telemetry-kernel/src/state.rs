/**
 * ÉTAT PARTAGÉ - Primitives de verrouillage communes au kernel
 *
 * `Shared<T>` : Arc + parking_lot::Mutex, verrou jamais tenu à travers un `.await`.
 * `OrderedSet<T>` : liste partagée sans doublon, ordre d'insertion conservé
 * (abonnements MQTT ré-émis dans l'ordre de déclaration).
 */

use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

#[derive(Debug)]
pub struct OrderedSet<T>(Shared<Vec<T>>);

impl<T> Clone for OrderedSet<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for OrderedSet<T> {
    fn default() -> Self {
        Self(new_state(Vec::new()))
    }
}

impl<T: PartialEq + Clone> OrderedSet<T> {
    /// false si la valeur était déjà présente
    pub fn insert(&self, value: T) -> bool {
        let mut items = self.0.lock();
        if items.contains(&value) {
            return false;
        }
        items.push(value);
        true
    }

    pub fn contains(&self, value: &T) -> bool {
        self.0.lock().contains(value)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}
